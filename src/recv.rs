//! `RecvPipeline` — the receive-and-apply half of the communicator
//! (spec.md §4.F), ported from `AsyncCommunicator::RecvByCommunicator`.
//! Unlike `SendPipeline` there is nothing to batch: every variable is
//! fetched independently and applied as-is.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::context::VariableContext;
use crate::error::CommResult;
use crate::rpc::{RpcClient, STATUS_OK};
use crate::variable::Scope;

/// Fetches every registered variable from its shard endpoints into a
/// shared recv scope, concurrently, bounded by a thread-pool-sized
/// semaphore (the original's `recv_threadpool_`, sized `thread_pool_size_`).
pub struct RecvPipeline {
    contexts: Vec<VariableContext>,
    pool: Arc<Semaphore>,
}

impl RecvPipeline {
    pub fn new(contexts: Vec<VariableContext>, thread_pool_size: usize) -> Self {
        RecvPipeline { contexts, pool: Arc::new(Semaphore::new(thread_pool_size.max(1))) }
    }

    pub async fn recv_all<R: RpcClient>(&self, rpc: &Arc<R>, recv_scope: &Arc<Scope>) -> CommResult<()> {
        let mut tasks = Vec::new();
        for ctx in &self.contexts {
            let rpc = rpc.clone();
            let scope = recv_scope.clone();
            let ctx = ctx.clone();
            let pool = self.pool.clone();
            tasks.push(async move {
                let _permit = pool.acquire_owned().await.expect("recv thread pool semaphore closed");
                let status = rpc.parameter_recv(&ctx, &scope).await;
                if status != STATUS_OK {
                    warn!(variable = %ctx.name, status, "recv RPC returned non-zero status");
                }
            });
        }
        join_all(tasks).await;
        Ok(())
    }
}
