//! The RPC transport façade (spec.md §1, §6): an opaque client with
//! futures. The real transport (request/response framing, retries,
//! connection pooling) is out of scope; this models just the four wire
//! operations plus the two parameter-wide send/recv helpers the core
//! calls, as async trait methods returning a 32-bit status.

use async_trait::async_trait;

use crate::context::VariableContext;
use crate::variable::Scope;

/// A 32-bit RPC status; `0` is success, matching spec.md §6.
pub type Status = i32;

pub const STATUS_OK: Status = 0;

/// The RPC client the Communicator drives. Implementors own connection
/// management to each `endpoint`; the core never inspects transport
/// internals, only the returned `Status`.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Sends `scope`'s variable `name` to `endpoint`.
    async fn async_send_var(&self, endpoint: &str, scope: &Scope, name: &str) -> Status;

    /// Fetches `out_name` (aliased as `alias`) from `endpoint` into
    /// `scope`'s `in_name`.
    async fn async_get_var(
        &self,
        endpoint: &str,
        scope: &Scope,
        in_name: &str,
        out_name: &str,
        alias: &str,
    ) -> Status;

    /// Issues a batch-barrier RPC to `endpoint`.
    async fn async_send_batch_barrier(&self, endpoint: &str) -> Status;

    /// Issues a fetch-barrier RPC to `endpoint`.
    async fn async_send_fetch_barrier(&self, endpoint: &str) -> Status;

    /// Sends every shard of `ctx`'s variable from `send_scope`, fanning
    /// out across `ctx.endpoints`.
    async fn async_send(&self, ctx: &VariableContext, send_scope: &Scope, timeout_ms: u64) -> Status {
        let _ = timeout_ms;
        let mut last = STATUS_OK;
        for ep in &ctx.endpoints {
            let s = self.async_send_var(ep, send_scope, &ctx.name).await;
            if s != STATUS_OK {
                last = s;
            }
        }
        last
    }

    /// Pulls `ctx`'s variable shards into `recv_scope`.
    async fn parameter_recv(&self, ctx: &VariableContext, recv_scope: &Scope) -> Status {
        let mut last = STATUS_OK;
        for (ep, shard) in ctx.endpoints.iter().zip(&ctx.shard_names) {
            let s = self
                .async_get_var(ep, recv_scope, &ctx.name, shard, shard)
                .await;
            if s != STATUS_OK {
                last = s;
            }
        }
        last
    }

    /// Pushes `ctx`'s variable shards from `send_scope` to the server,
    /// the dense counterpart of `async_send_var` used by GEO's
    /// `SendDense`.
    async fn parameter_send(&self, ctx: &VariableContext, send_scope: &Scope) -> Status {
        let mut last = STATUS_OK;
        for ep in &ctx.endpoints {
            let s = self.async_send_var(ep, send_scope, &ctx.name).await;
            if s != STATUS_OK {
                last = s;
            }
        }
        last
    }
}
