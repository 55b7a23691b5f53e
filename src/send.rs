//! `SendPipeline` — the merge-and-send half of the communicator (spec.md
//! §4.E), ported from the original's `AsyncCommunicator::SendByCommunicator`
//! / `SendGlobalStep` thread-pool dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::context::VariableContext;
use crate::error::{CommError, CommResult};
use crate::merge::merge;
use crate::queue::BoundedQueue;
use crate::rpc::{RpcClient, STATUS_OK};
use crate::variable::{Scope, Variable, STEP_COUNTER};

/// One variable's send-side queue plus its routing context. The queue is
/// `Arc`-wrapped so its blocking `pop` can run on a `spawn_blocking` task
/// without borrowing from `SendPipeline`.
pub struct SendChannel {
    pub ctx: VariableContext,
    pub queue: Arc<BoundedQueue<Variable>>,
}

impl SendChannel {
    pub fn new(ctx: VariableContext, queue_size: usize) -> Self {
        SendChannel { ctx, queue: Arc::new(BoundedQueue::new(queue_size)) }
    }
}

/// Drives every registered variable's merge-and-send cycle. The training
/// loop's only interaction with this type is `submit`; `send_all` is
/// driven by `CommunicatorCore`.
pub struct SendPipeline {
    channels: HashMap<String, SendChannel>,
    /// Bounds how many channels drain/merge/send concurrently, the
    /// `ThreadPool(thread_pool_size_)` the original hands
    /// `SendByCommunicator`'s per-variable tasks to.
    pool: Arc<Semaphore>,
}

impl SendPipeline {
    pub fn new(channels: HashMap<String, SendChannel>, thread_pool_size: usize) -> Self {
        SendPipeline { channels, pool: Arc::new(Semaphore::new(thread_pool_size.max(1))) }
    }

    /// Enqueues `var` for the next merge-and-send cycle. Blocks if that
    /// variable's queue is already at `communicator_send_queue_size`
    /// capacity — the queue is the pipeline's only backpressure (see
    /// DESIGN.md's Open Question 3 resolution); there is no separate
    /// drop-oldest or overflow path.
    pub fn submit(&self, name: &str, var: Variable) {
        if let Some(chan) = self.channels.get(name) {
            chan.queue.push(var);
        }
    }

    /// Blocks each registered variable's queue until exactly `batch` items
    /// have arrived, merges them, and fans the merged results out over
    /// `rpc` — the original's `SendByCommunicator(batches)`, which pops
    /// `var_queue->Pop()` exactly `batches` times per variable before
    /// merging. `batch == 0` is a no-op: nothing was accumulated this
    /// round. Concurrency across variables is bounded by the pipeline's
    /// thread-pool-sized semaphore, not left to run unbounded.
    pub async fn send_all<R: RpcClient>(&self, rpc: &Arc<R>, timeout_ms: u64, batch: usize) -> CommResult<()> {
        if batch == 0 {
            return Ok(());
        }

        let mut sends = Vec::new();
        for (name, chan) in &self.channels {
            let queue = chan.queue.clone();
            let rpc = rpc.clone();
            let ctx = chan.ctx.clone();
            let name = name.clone();
            let pool = self.pool.clone();
            sends.push(async move {
                let _permit = pool.acquire_owned().await.expect("send thread pool semaphore closed");
                let drained = tokio::task::spawn_blocking(move || {
                    (0..batch).map(|_| queue.pop()).collect::<Vec<Variable>>()
                })
                .await
                .expect("send queue drain task panicked");

                debug!(variable = %name, batch_len = drained.len(), "merging send batch");
                let merged = merge(&drained, ctx.merge_mode)?;
                let scope = Scope::new();
                scope.set(name, merged);
                let status = rpc.async_send(&ctx, &scope, timeout_ms).await;
                if status != STATUS_OK {
                    warn!(variable = %ctx.name, status, "send RPC returned non-zero status");
                }
                Ok::<(), CommError>(())
            });
        }
        for result in join_all(sends).await {
            result?;
        }
        Ok(())
    }

    /// Sends the distinguished step-counter variable ahead of the
    /// per-variable loop, bypassing merge and the per-variable queues
    /// entirely (spec.md §4.E).
    pub async fn send_global_step<R: RpcClient>(
        &self,
        rpc: &R,
        ctx: &VariableContext,
        batch: i64,
    ) -> CommResult<()> {
        let scope = Scope::new();
        scope.set(STEP_COUNTER, Variable::step_counter(batch));
        let status = rpc.async_send(ctx, &scope, 0).await;
        if status != STATUS_OK {
            warn!(status, "send_global_step RPC returned non-zero status");
        }
        Ok(())
    }
}
