//! `CommunicatorCore` — the orchestrator state machine (spec.md §4.G),
//! collapsing the original's `Communicator`/`AsyncCommunicator`/
//! `HalfAsyncCommunicator`/`SyncCommunicator` inheritance chain into one
//! struct carrying a `Mode` tag (spec.md §9 design note). GEO's main loop
//! lives in `GeoEngine` instead — its send/recv shape diverges enough from
//! the other three disciplines that folding it in here would just be a
//! third `match self.config.mode` fork around otherwise-dead fields.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::info;

use crate::config::CommunicatorConfig;
use crate::context::VariableContext;
use crate::error::{CommError, CommResult};
use crate::recv::RecvPipeline;
use crate::rpc::{RpcClient, STATUS_OK};
use crate::send::SendPipeline;
use crate::variable::{Scope, Variable};

/// Which synchronization discipline drives the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Async,
    HalfAsync,
    Sync,
    Geo,
}

/// Counts batches submitted to the send pipeline since the last cycle,
/// the original's `BatchesCounter`. Async polls this down without
/// blocking; HalfAsync/Sync gate their recv on it via
/// `min_send_grad_num_before_recv`.
#[derive(Default)]
pub struct BatchesCounter {
    count: AtomicUsize,
}

impl BatchesCounter {
    pub fn increment(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset(&self) -> usize {
        self.count.swap(0, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// The client-side HalfAsync gate (spec.md §4.G): `barrier_counter` and
/// `barrier_trigger`, with a condition variable parking trainer threads
/// in `Barrier()` until the round releases. This is distinct from the
/// server-side `BarrierMonitor` (spec.md §4.I) — the two coincidentally
/// share vocabulary (`barrier_trigger_decrement`, `barrier_weak_up`) but
/// one lives in the trainer process, the other on a pserver shard.
pub struct ClientBarrier {
    counter: Mutex<i64>,
    trigger: AtomicI64,
    cv: Condvar,
}

impl Default for ClientBarrier {
    fn default() -> Self {
        ClientBarrier { counter: Mutex::new(0), trigger: AtomicI64::new(0), cv: Condvar::new() }
    }
}

impl ClientBarrier {
    /// Called by a trainer thread: increments `barrier_counter`, then
    /// blocks until the main loop fires `BarrierWeakUp` and resets it to 0.
    pub fn barrier(&self) {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let _ = self.cv.wait_while(counter, |c| *c != 0).unwrap();
    }

    /// `BarrierTriggerReset(n)`: sets the expected-arrivals trigger for
    /// the next round.
    pub fn trigger_reset(&self, n: i64) {
        self.trigger.store(n, Ordering::SeqCst);
    }

    /// `BarrierTriggerDecrement`: lowers the trigger by one, fired by the
    /// main loop after each send so the gate tightens as sends land.
    pub fn trigger_decrement(&self) {
        self.trigger.fetch_sub(1, Ordering::SeqCst);
    }

    /// `BarrierWeakUp`: releases every trainer parked in `barrier()`.
    pub fn weak_up(&self) {
        let mut counter = self.counter.lock().unwrap();
        *counter = 0;
        self.cv.notify_all();
    }

    pub fn counter(&self) -> i64 {
        *self.counter.lock().unwrap()
    }

    pub fn trigger(&self) -> i64 {
        self.trigger.load(Ordering::SeqCst)
    }
}

/// Orchestrates one training job's send/recv cycle for every registered
/// dense variable, per `config.mode`. Sparse/GEO variables are driven
/// separately through `GeoEngine`.
pub struct CommunicatorCore<R: RpcClient> {
    pub config: CommunicatorConfig,
    pub send: SendPipeline,
    pub recv: RecvPipeline,
    pub rpc: Arc<R>,
    pub send_scope: Arc<Scope>,
    pub recv_scope: Arc<Scope>,
    pub batches: BatchesCounter,
    pub client_barrier: ClientBarrier,
    /// Observed by `run_forever`'s main loop; `Stop()` clears it between
    /// iterations (spec.md §5's "Cancellation / shutdown").
    pub running: AtomicBool,
    global_step: AtomicI64,
}

impl<R: RpcClient> CommunicatorCore<R> {
    pub fn new(config: CommunicatorConfig, send: SendPipeline, recv: RecvPipeline, rpc: Arc<R>) -> Self {
        CommunicatorCore {
            config,
            send,
            recv,
            rpc,
            send_scope: Arc::new(Scope::new()),
            recv_scope: Arc::new(Scope::new()),
            batches: BatchesCounter::default(),
            client_barrier: ClientBarrier::default(),
            running: AtomicBool::new(true),
            global_step: AtomicI64::new(0),
        }
    }

    /// Records one training-loop iteration's gradient into the send
    /// pipeline. Called from the training loop's own thread, never from a
    /// task this core spawns. A round may call this any number of times —
    /// once per registered variable that changed — so this alone does not
    /// advance the batch counter; call `end_batch` once the round's
    /// pushes are all submitted.
    pub fn push_batch(&self, name: &str, var: Variable) {
        self.send.submit(name, var);
    }

    /// Marks one training round complete, the analogue of the original's
    /// per-round `STEP_COUNTER` push: `push_batch` is called once per
    /// variable, but a round counts once regardless of how many variables
    /// it touched. `wait_async_batch`/`wait_half_async_batch` read this
    /// counter to decide when a cycle's `batch` is ready.
    pub fn end_batch(&self) {
        self.batches.increment();
    }

    /// The trainer-facing entry point in HalfAsync/Sync mode: blocks the
    /// calling thread until the main loop completes a round and calls
    /// `barrier_weak_up`.
    pub fn barrier(&self) {
        self.client_barrier.barrier();
    }

    /// `Stop()`: the main loop observes this between iterations and exits;
    /// any trainers parked in `barrier()` are released so they do not hang.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.client_barrier.weak_up();
    }

    /// The spec.md §4.G main loop, driven forever until `stop()`. Intended
    /// to be spawned as the communicator's one main task/thread; the
    /// training loop interacts only through `push_batch`/`barrier`.
    pub async fn run_forever(&self, step_ctx: &VariableContext) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let batch = match self.config.mode {
                Mode::Async => self.wait_async_batch().await,
                Mode::HalfAsync | Mode::Sync => self.wait_half_async_batch().await,
                Mode::Geo => {
                    info!("run_forever: Geo mode is driven by GeoEngine, not CommunicatorCore");
                    return;
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            if batch == 0 {
                info!("batch is 0, skipping this round");
                continue;
            }

            if let Err(err) = self.run_cycle(step_ctx, batch).await {
                match err {
                    CommError::Rpc(..) if !matches!(self.config.mode, Mode::Sync) => {
                        tracing::warn!(error = %err, "round failed, continuing (non-fatal in this mode)");
                    }
                    other => {
                        tracing::error!(error = %other, "round failed fatally");
                        return;
                    }
                }
            }

            self.client_barrier.weak_up();
        }
    }

    /// Async's `BatchesCounter`: polls every 10ms until the step queue has
    /// at least `max_merge_var_num` items, giving up after
    /// `send_wait_times` polls have returned with no new progress since
    /// the last check and returning however many accumulated (possibly
    /// zero).
    async fn wait_async_batch(&self) -> usize {
        let target = self.config.max_merge_var_num;
        let mut last_seen = self.batches.get();
        let mut idle_polls = 0usize;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return self.batches.get();
            }
            let current = self.batches.get();
            if current >= target {
                return current;
            }
            if current == last_seen {
                idle_polls += 1;
                if idle_polls >= self.config.send_wait_times {
                    return current;
                }
            } else {
                idle_polls = 0;
                last_seen = current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// HalfAsync/Sync's `BatchesCounter`: waits on the client barrier's
    /// atomics until `barrier_counter >= barrier_trigger && barrier_trigger
    /// > 0`, polling rather than condvar-waiting since the trigger is set
    /// by a different thread than the one this loop parks on.
    async fn wait_half_async_batch(&self) -> usize {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return self.batches.get();
            }
            let trigger = self.client_barrier.trigger();
            let counter = self.client_barrier.counter();
            if trigger > 0 && counter >= trigger {
                return self.batches.get();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Runs one full send/recv cycle appropriate to `config.mode`,
    /// block-popping exactly `batch` items per variable's send queue (the
    /// round's size, as determined by `wait_async_batch`/
    /// `wait_half_async_batch`).
    pub async fn run_cycle(&self, step_ctx: &VariableContext, batch: usize) -> CommResult<()> {
        match self.config.mode {
            Mode::Async => self.run_async_cycle(step_ctx, batch).await,
            Mode::HalfAsync => self.run_half_async_cycle(step_ctx, batch).await,
            Mode::Sync => self.run_sync_cycle(step_ctx, batch).await,
            Mode::Geo => Err(CommError::ContractViolation(
                "Geo mode is driven by GeoEngine, not CommunicatorCore::run_cycle".into(),
            )),
        }
    }

    async fn send_step_if_needed(&self, step_ctx: &VariableContext, batch: usize) -> CommResult<()> {
        if self.config.need_global_step {
            self.send.send_global_step(self.rpc.as_ref(), step_ctx, batch as i64).await?;
        }
        Ok(())
    }

    /// Async never blocks on recv thresholds within a single cycle call —
    /// the training loop calls `run_cycle` as often as it likes and the
    /// queue itself is the only gate (DESIGN.md Open Question 3). Recv
    /// fires once enough batches have accumulated since the last one.
    /// The counter is reset as soon as `batch` items are drained from the
    /// send queues, since those rounds are now accounted for regardless
    /// of whether this cycle also recvs.
    async fn run_async_cycle(&self, step_ctx: &VariableContext, batch: usize) -> CommResult<()> {
        info!("async send cycle");
        self.send_step_if_needed(step_ctx, batch).await?;
        self.send.send_all(&self.rpc, self.config.pserver_timeout.as_millis() as u64, batch).await?;
        self.batches.reset();
        if batch >= self.config.min_send_grad_num_before_recv {
            self.recv.recv_all(&self.rpc, &self.recv_scope).await?;
        }
        Ok(())
    }

    /// HalfAsync sends unconditionally, like Async, but also decrements
    /// the client barrier's trigger after every send so the gate tightens
    /// toward release (`HalfAsyncCommunicator::BarrierTriggerDecrement`),
    /// then always recvs — unlike Async it does not wait to batch up
    /// multiple sends before pulling fresh parameters.
    async fn run_half_async_cycle(&self, step_ctx: &VariableContext, batch: usize) -> CommResult<()> {
        info!("half-async send cycle");
        self.send_step_if_needed(step_ctx, batch).await?;
        self.send.send_all(&self.rpc, self.config.pserver_timeout.as_millis() as u64, batch).await?;
        self.batches.reset();
        self.client_barrier.trigger_decrement();
        self.recv.recv_all(&self.rpc, &self.recv_scope).await?;
        Ok(())
    }

    /// Sync brackets send and recv with a batch barrier and a fetch
    /// barrier respectively, so every trainer's send lands before any
    /// trainer's recv begins (`SyncCommunicator::BarrierSend`/
    /// `BarrierRecv`).
    async fn run_sync_cycle(&self, step_ctx: &VariableContext, batch: usize) -> CommResult<()> {
        info!("sync send cycle");
        self.send_step_if_needed(step_ctx, batch).await?;
        self.send.send_all(&self.rpc, self.config.pserver_timeout.as_millis() as u64, batch).await?;
        self.batches.reset();
        self.barrier_send(step_ctx).await?;
        self.recv.recv_all(&self.rpc, &self.recv_scope).await?;
        self.barrier_recv(step_ctx).await?;
        Ok(())
    }

    /// Issues a batch-barrier RPC to every pserver endpoint named in
    /// `ctx`, propagating the first non-zero status as a hard error — a
    /// barrier RPC failure means some trainers may never be released.
    async fn barrier_send(&self, ctx: &VariableContext) -> CommResult<()> {
        for ep in &ctx.endpoints {
            let status = self.rpc.async_send_batch_barrier(ep).await;
            if status != STATUS_OK {
                return Err(CommError::Rpc(format!("BarrierSend({ep})"), status));
            }
        }
        Ok(())
    }

    /// Issues a fetch-barrier RPC to every pserver endpoint, the
    /// `BarrierRecv` counterpart.
    async fn barrier_recv(&self, ctx: &VariableContext) -> CommResult<()> {
        for ep in &ctx.endpoints {
            let status = self.rpc.async_send_fetch_barrier(ep).await;
            if status != STATUS_OK {
                return Err(CommError::Rpc(format!("BarrierRecv({ep})"), status));
            }
        }
        Ok(())
    }

    /// `BarrierTriggerReset(n)`: sets the expected-arrivals count for the
    /// next HalfAsync round. Called at the top of a new global step.
    pub fn barrier_trigger_reset(&self, n: i64) {
        self.client_barrier.trigger_reset(n);
    }

    /// Wakes every trainer thread parked in `barrier()`.
    pub fn barrier_weak_up(&self) {
        self.client_barrier.weak_up();
    }

    pub fn global_step(&self) -> i64 {
        self.global_step.load(Ordering::SeqCst)
    }

    pub fn advance_global_step(&self) -> i64 {
        self.global_step.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn batches_counter_increments_and_resets() {
        let counter = BatchesCounter::default();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.get(), 2);
        assert_eq!(counter.reset(), 2);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn client_barrier_releases_all_waiters_on_weak_up() {
        // S2: two trainers call Barrier() and only return once the round
        // releases; barrier_counter ends at 0.
        let barrier = Arc::new(ClientBarrier::default());
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || barrier.barrier())
            })
            .collect();

        // Give both trainers a chance to park.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(barrier.counter(), 2);

        barrier.weak_up();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(barrier.counter(), 0);
    }

    #[test]
    fn trigger_reset_and_decrement() {
        let barrier = ClientBarrier::default();
        barrier.trigger_reset(3);
        assert_eq!(barrier.trigger(), 3);
        barrier.trigger_decrement();
        assert_eq!(barrier.trigger(), 2);
    }
}
