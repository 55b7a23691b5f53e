//! Top-level process lifecycle (spec.md §3): "constructed once with its
//! VariableContexts and scopes, started (spawns main and receive
//! goroutines/threads), drained on `Stop`". `StandardCommunicator` wraps
//! `CommunicatorCore`'s main loop; `GeoCommunicator` wraps `GeoEngine`'s.
//! Both are thin: `start()` spawns the loop as a detached task, `stop()`
//! signals it to exit and awaits the join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::communicator::CommunicatorCore;
use crate::context::VariableContext;
use crate::geo::GeoEngine;
use crate::rpc::RpcClient;
use crate::variable::Scope;

/// Owns the spawned main-loop task for an Async/HalfAsync/Sync
/// communicator. The training loop's only other touch points are
/// `core.push_batch`/`core.end_batch` and, in HalfAsync/Sync, `core.barrier()`.
pub struct StandardCommunicator<R: RpcClient + 'static> {
    pub core: Arc<CommunicatorCore<R>>,
    step_ctx: VariableContext,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RpcClient + 'static> StandardCommunicator<R> {
    pub fn new(core: Arc<CommunicatorCore<R>>, step_ctx: VariableContext) -> Self {
        StandardCommunicator { core, step_ctx, handle: Mutex::new(None) }
    }

    /// Spawns the main loop as a detached task. Calling `start` again
    /// while one is already running is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let core = self.core.clone();
        let step_ctx = self.step_ctx.clone();
        *handle = Some(tokio::spawn(async move { core.run_forever(&step_ctx).await }));
    }

    /// `Stop()`: flips `running` to false, releases any trainers parked in
    /// `core.barrier()`, and awaits the main loop task's exit.
    pub async fn stop(&self) {
        self.core.stop();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Owns the spawned main-loop task for a GEO communicator.
pub struct GeoCommunicator<R: RpcClient + 'static> {
    pub engine: Arc<GeoEngine>,
    rpc: Arc<R>,
    pub local_scope: Arc<Scope>,
    pub send_scope: Arc<Scope>,
    pub pserver_scope: Arc<Scope>,
    max_merge_var_num: usize,
    send_wait_times: usize,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RpcClient + 'static> GeoCommunicator<R> {
    pub fn new(
        engine: Arc<GeoEngine>,
        rpc: Arc<R>,
        local_scope: Arc<Scope>,
        send_scope: Arc<Scope>,
        pserver_scope: Arc<Scope>,
        max_merge_var_num: usize,
        send_wait_times: usize,
    ) -> Self {
        GeoCommunicator {
            engine,
            rpc,
            local_scope,
            send_scope,
            pserver_scope,
            max_merge_var_num,
            send_wait_times,
            running: Arc::new(AtomicBool::new(true)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let engine = self.engine.clone();
        let rpc = self.rpc.clone();
        let local = self.local_scope.clone();
        let send_scope = self.send_scope.clone();
        let pserver_scope = self.pserver_scope.clone();
        let max_merge_var_num = self.max_merge_var_num;
        let send_wait_times = self.send_wait_times;
        let running = self.running.clone();
        *handle = Some(tokio::spawn(async move {
            engine
                .run_forever(
                    rpc.as_ref(),
                    &local,
                    &send_scope,
                    &pserver_scope,
                    max_merge_var_num,
                    send_wait_times,
                    &running,
                )
                .await
        }));
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
