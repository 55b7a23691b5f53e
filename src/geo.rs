//! `GeoEngine` — GEO's delta-based sparse/dense synchronization (spec.md
//! §4.H), ported from `communicator.cc`'s `GeoCommunicator::*`. Unlike the
//! other three disciplines, GEO never sends a full variable: it diffs the
//! local scope against a shadow copy of the last-known server state and
//! sends only the difference, scaled by the trainer count.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::context::VariableContext;
use crate::error::{CommError, CommResult};
use crate::mathops::{vec_add_assign, vec_scale, vec_sub};
use crate::queue::BoundedQueue;
use crate::rpc::{RpcClient, STATUS_OK};
use crate::variable::{Scope, Variable};

/// Per-sparse-variable touched-row queue: the training loop pushes every
/// row index its local optimizer updates; `send_sparse` drains it.
pub struct SparseIdQueue {
    pub ctx: VariableContext,
    pub ids: BoundedQueue<u64>,
}

/// The last-known server state for every GEO-synchronized variable,
/// diffed against the local scope to produce a delta instead of a full
/// resend (spec.md §3's "shadow copy").
#[derive(Default)]
struct GeoShadow {
    dense: DashMap<String, Vec<f32>>,
    sparse: DashMap<(String, u64), Vec<f32>>,
}

impl GeoShadow {
    fn dense_or_zero(&self, name: &str, width: usize) -> Vec<f32> {
        self.dense.entry(name.to_string()).or_insert_with(|| vec![0.0; width]).clone()
    }

    fn sparse_row_or_zero(&self, name: &str, row: u64, width: usize) -> Vec<f32> {
        self.sparse
            .entry((name.to_string(), row))
            .or_insert_with(|| vec![0.0; width])
            .clone()
    }
}

/// Drives GEO's init/send/recv cycle for every registered dense and
/// sparse variable.
pub struct GeoEngine {
    trainers: i32,
    dense_contexts: Vec<VariableContext>,
    sparse_queues: HashMap<String, SparseIdQueue>,
    shadow: GeoShadow,
    dense_early_return_bug: bool,
    /// The GEO analogue of `BatchesCounter` (spec.md §4.H's main loop):
    /// counts `touch_sparse_row` calls since the last round, gating
    /// `run_forever`'s batching the same way the other three disciplines'
    /// `BatchesCounter` does.
    batches: AtomicUsize,
}

impl GeoEngine {
    pub fn new(
        trainers: i32,
        dense_contexts: Vec<VariableContext>,
        sparse_queues: HashMap<String, SparseIdQueue>,
        dense_early_return_bug: bool,
    ) -> Self {
        GeoEngine {
            trainers,
            dense_contexts,
            sparse_queues,
            shadow: GeoShadow::default(),
            dense_early_return_bug,
            batches: AtomicUsize::new(0),
        }
    }

    /// The training loop's hook for a sparse variable's per-batch touched
    /// rows; queues `row_id` for the next delta cycle (original's
    /// `GeoCommunicator::Send`).
    pub fn touch_sparse_row(&self, name: &str, row_id: u64) {
        if let Some(q) = self.sparse_queues.get(name) {
            q.ids.push(row_id);
            self.batches.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Pulls the server's current values for every registered dense
    /// variable into `scope` and seeds the shadow copy, the original's
    /// `InitParams`/`InitDense`.
    pub async fn init_params<R: RpcClient>(&self, rpc: &R, scope: &Scope) -> CommResult<()> {
        for ctx in &self.dense_contexts {
            let status = rpc.parameter_recv(ctx, scope).await;
            if status != STATUS_OK {
                return Err(CommError::Rpc(format!("InitDense({})", ctx.name), status));
            }
            if let Some(v) = scope.get(&ctx.name) {
                if let Variable::Dense { data, .. } = &*v {
                    self.shadow.dense.insert(ctx.name.clone(), data.clone());
                }
            }
        }
        Ok(())
    }

    /// Pulls one sparse variable's initial rows for `keys` (the original's
    /// `InitSparse`, invoked lazily the first time a key is touched rather
    /// than eagerly for the whole table).
    pub async fn init_sparse_rows<R: RpcClient>(
        &self,
        rpc: &R,
        ctx: &VariableContext,
        scope: &Scope,
        keys: &[u64],
    ) -> CommResult<()> {
        let status = rpc.parameter_recv(ctx, scope).await;
        if status != STATUS_OK {
            return Err(CommError::Rpc(format!("InitSparse({})", ctx.name), status));
        }
        if let Some(v) = scope.get(&ctx.name) {
            if let Variable::SparseRow { rows, data, width, .. } = &*v {
                for (i, &row) in rows.iter().enumerate() {
                    if keys.contains(&row) {
                        self.shadow
                            .sparse
                            .insert((ctx.name.clone(), row), data[i * width..(i + 1) * width].to_vec());
                    }
                }
            }
        }
        Ok(())
    }

    /// Computes and sends the delta for one sparse variable's queued rows:
    /// `delta = (latest - shadow) / trainers`, then advances `shadow +=
    /// delta` locally so the next cycle diffs from the post-send state.
    /// Rows are grouped by owning shard (`VariableContext::shard_of`) so
    /// each shard's pserver only receives the rows it owns. The
    /// touched-row queue is drained non-blockingly, so a cycle with
    /// nothing queued is a cheap no-op (original's `SendSparse`).
    pub async fn send_sparse<R: RpcClient>(
        &self,
        rpc: &R,
        name: &str,
        local: &Scope,
        send_scope: &Scope,
    ) -> CommResult<()> {
        let q = self
            .sparse_queues
            .get(name)
            .ok_or_else(|| CommError::ContractViolation(format!("unregistered sparse variable `{name}`")))?;

        let mut rows = Vec::new();
        while let Some(id) = q.ids.try_pop() {
            if !rows.contains(&id) {
                rows.push(id);
            }
        }
        if rows.is_empty() {
            return Ok(());
        }
        rows.sort_unstable();

        let local_ref = local
            .get(name)
            .ok_or_else(|| CommError::NotInitialized(name.to_string()))?;
        let (height, width, local_rows, local_data) = match &*local_ref {
            Variable::SparseRow { height, width, rows, data } => (*height, *width, rows.clone(), data.clone()),
            Variable::Dense { .. } => {
                return Err(CommError::ContractViolation(format!("`{name}` is not sparse")))
            }
        };
        drop(local_ref);

        let mut by_shard: HashMap<usize, (Vec<u64>, Vec<f32>)> = HashMap::new();
        for &row in &rows {
            let pos = local_rows
                .iter()
                .position(|&r| r == row)
                .ok_or_else(|| CommError::NotFound(format!("row {row} of `{name}`")))?;
            let latest = &local_data[pos * width..(pos + 1) * width];
            let shadow = self.shadow.sparse_row_or_zero(name, row, width);

            let mut delta = vec![0.0; width];
            vec_sub(latest, &shadow, &mut delta);
            vec_scale(&mut delta, 1.0 / self.trainers as f32);

            let mut next_shadow = shadow;
            vec_add_assign(&mut next_shadow, &delta);
            self.shadow.sparse.insert((name.to_string(), row), next_shadow);

            let shard = q.ctx.shard_of(row);
            let entry = by_shard.entry(shard).or_insert_with(|| (Vec::new(), Vec::new()));
            entry.0.push(row);
            entry.1.extend_from_slice(&delta);
        }

        for (shard, (shard_rows, shard_data)) in by_shard {
            send_scope.set(
                name.to_string(),
                Variable::SparseRow { height, rows: shard_rows, width, data: shard_data },
            );
            let endpoint = &q.ctx.endpoints[shard];
            let status = rpc.async_send_var(endpoint, send_scope, name).await;
            if status != STATUS_OK {
                warn!(variable = name, shard, status, "GEO send_sparse RPC returned non-zero status");
            }
        }
        Ok(())
    }

    /// Fetches one sparse variable's current rows from the server into
    /// `pserver_scope`, then applies each row as an additive delta against
    /// the shadow onto `local`'s existing value — never a plain overwrite,
    /// since the trainer may have kept producing gradients for that row
    /// between `send_sparse` and this call (spec.md §4.H's `RecvSparse`:
    /// `v = t_srv[j] - shadow[j]; latest[id] += v; shadow[j] = t_srv[j]`).
    /// Rows the server returns that `local` has never held are inserted
    /// fresh (equivalent to `latest` starting at zero for that row).
    pub async fn recv_sparse<R: RpcClient>(
        &self,
        rpc: &R,
        ctx: &VariableContext,
        local: &Scope,
        pserver_scope: &Scope,
    ) -> CommResult<()> {
        let status = rpc.parameter_recv(ctx, pserver_scope).await;
        if status != STATUS_OK {
            return Err(CommError::Rpc(format!("RecvSparse({})", ctx.name), status));
        }

        let server_ref = pserver_scope
            .get(&ctx.name)
            .ok_or_else(|| CommError::NotInitialized(ctx.name.clone()))?;
        let (srv_rows, srv_data, width) = match &*server_ref {
            Variable::SparseRow { rows, data, width, .. } => (rows.clone(), data.clone(), *width),
            Variable::Dense { .. } => {
                return Err(CommError::ContractViolation(format!("`{}` is not sparse", ctx.name)))
            }
        };
        drop(server_ref);

        for (i, &row) in srv_rows.iter().enumerate() {
            let t_srv = &srv_data[i * width..(i + 1) * width];
            let shadow = self.shadow.sparse_row_or_zero(&ctx.name, row, width);
            let mut delta = vec![0.0; width];
            vec_sub(t_srv, &shadow, &mut delta);

            let mut local_ref = local
                .get_mut(&ctx.name)
                .ok_or_else(|| CommError::NotInitialized(ctx.name.clone()))?;
            match &mut *local_ref {
                Variable::SparseRow { rows, data, width: w, .. } => {
                    if let Some(pos) = rows.iter().position(|&r| r == row) {
                        let slot = &mut data[pos * *w..(pos + 1) * *w];
                        vec_add_assign(slot, &delta);
                    } else {
                        rows.push(row);
                        data.extend_from_slice(t_srv);
                    }
                }
                Variable::Dense { .. } => {
                    return Err(CommError::ContractViolation(format!("`{}` is not sparse", ctx.name)))
                }
            }
            drop(local_ref);

            self.shadow.sparse.insert((ctx.name.clone(), row), t_srv.to_vec());
        }
        Ok(())
    }

    /// Computes and sends one dense variable's full delta against its
    /// shadow. Returns whether anything was actually sent. When
    /// `dense_early_return_bug` is set, reproduces the original's
    /// suppressed send (the commented-out call spec.md §9's Open Question
    /// refers to) — the delta and shadow are still computed, but nothing
    /// goes over the wire; the caller should skip `recv_dense` in that
    /// case, since there is nothing fresh to pull.
    pub async fn send_dense<R: RpcClient>(
        &self,
        rpc: &R,
        ctx: &VariableContext,
        local: &Scope,
        send_scope: &Scope,
    ) -> CommResult<bool> {
        let local_ref = local
            .get(&ctx.name)
            .ok_or_else(|| CommError::NotInitialized(ctx.name.clone()))?;
        let (shape, dtype, data) = match &*local_ref {
            Variable::Dense { shape, dtype, data } => (shape.clone(), *dtype, data.clone()),
            Variable::SparseRow { .. } => {
                return Err(CommError::ContractViolation(format!("`{}` is not dense", ctx.name)))
            }
        };
        drop(local_ref);

        let shadow_data = self.shadow.dense_or_zero(&ctx.name, data.len());

        let mut delta = vec![0.0; data.len()];
        vec_sub(&data, &shadow_data, &mut delta);
        vec_scale(&mut delta, 1.0 / self.trainers as f32);

        let mut next_shadow = shadow_data;
        vec_add_assign(&mut next_shadow, &delta);
        self.shadow.dense.insert(ctx.name.clone(), next_shadow);

        if self.dense_early_return_bug {
            debug!(variable = %ctx.name, "GEO dense send suppressed (geo_dense_early_return_bug)");
            return Ok(false);
        }

        send_scope.set(ctx.name.clone(), Variable::Dense { shape, dtype, data: delta });
        let status = rpc.async_send(ctx, send_scope, 0).await;
        if status != STATUS_OK {
            warn!(variable = %ctx.name, status, "GEO send_dense RPC returned non-zero status");
        }
        Ok(true)
    }

    /// Fetches one dense variable's current value into `pserver_scope`,
    /// applies `delta = pserver - old` onto `local`'s existing value
    /// (additive, not a replace), and syncs the shadow to the server's
    /// value (spec.md §4.H's `RecvDense`).
    pub async fn recv_dense<R: RpcClient>(
        &self,
        rpc: &R,
        ctx: &VariableContext,
        local: &Scope,
        pserver_scope: &Scope,
    ) -> CommResult<()> {
        let status = rpc.parameter_recv(ctx, pserver_scope).await;
        if status != STATUS_OK {
            return Err(CommError::Rpc(format!("RecvDense({})", ctx.name), status));
        }

        let server_ref = pserver_scope
            .get(&ctx.name)
            .ok_or_else(|| CommError::NotInitialized(ctx.name.clone()))?;
        let srv_data = match &*server_ref {
            Variable::Dense { data, .. } => data.clone(),
            Variable::SparseRow { .. } => {
                return Err(CommError::ContractViolation(format!("`{}` is not dense", ctx.name)))
            }
        };
        drop(server_ref);

        let shadow = self.shadow.dense_or_zero(&ctx.name, srv_data.len());
        let mut delta = vec![0.0; srv_data.len()];
        vec_sub(&srv_data, &shadow, &mut delta);

        let mut local_ref = local
            .get_mut(&ctx.name)
            .ok_or_else(|| CommError::NotInitialized(ctx.name.clone()))?;
        match &mut *local_ref {
            Variable::Dense { data, .. } => vec_add_assign(data, &delta),
            Variable::SparseRow { .. } => {
                return Err(CommError::ContractViolation(format!("`{}` is not dense", ctx.name)))
            }
        }
        drop(local_ref);

        self.shadow.dense.insert(ctx.name.clone(), srv_data);
        Ok(())
    }

    /// One full GEO round (spec.md §4.H's main loop step 2-3): every
    /// registered dense variable gets a send-then-recv task, every
    /// registered sparse variable gets a send-then-recv task, and all of
    /// them run concurrently — a slow shard on one variable does not hold
    /// up another variable's round trip. `send_sparse`/`send_dense` are
    /// themselves cheap no-ops when nothing was queued, so a variable with
    /// no touched rows or no drift this round just returns immediately.
    /// `dense_early_return_bug` already short-circuits `recv_dense` inside
    /// this function, matching `send_dense`'s own suppressed-send flag.
    pub async fn run_cycle<'a, R: RpcClient>(
        &'a self,
        rpc: &'a R,
        local: &'a Scope,
        send_scope: &'a Scope,
        pserver_scope: &'a Scope,
    ) -> CommResult<()> {
        let mut tasks: Vec<Pin<Box<dyn Future<Output = CommResult<()>> + 'a>>> = Vec::new();

        for ctx in &self.dense_contexts {
            tasks.push(Box::pin(async move {
                let sent = self.send_dense(rpc, ctx, local, send_scope).await?;
                if sent {
                    self.recv_dense(rpc, ctx, local, pserver_scope).await?;
                }
                Ok(())
            }));
        }

        for (name, q) in &self.sparse_queues {
            tasks.push(Box::pin(async move {
                self.send_sparse(rpc, name, local, send_scope).await?;
                self.recv_sparse(rpc, &q.ctx, local, pserver_scope).await?;
                Ok(())
            }));
        }

        for result in futures::future::join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    /// Waits for at least `target` touched rows to have accumulated since
    /// the last round, polling every 10ms and giving up after
    /// `give_up_polls` polls have seen no further progress — the same
    /// wait-budget rule as Async's `BatchesCounter` (spec.md §4.H: "same
    /// wait-budget rule as Async").
    async fn wait_batch(&self, target: usize, give_up_polls: usize, running: &AtomicBool) -> usize {
        let mut last_seen = self.batches.load(Ordering::SeqCst);
        let mut idle_polls = 0usize;
        loop {
            if !running.load(Ordering::SeqCst) {
                return self.batches.load(Ordering::SeqCst);
            }
            let current = self.batches.load(Ordering::SeqCst);
            if current >= target {
                return current;
            }
            if current == last_seen {
                idle_polls += 1;
                if idle_polls >= give_up_polls {
                    return current;
                }
            } else {
                idle_polls = 0;
                last_seen = current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// GEO's main loop (spec.md §4.H), driven forever until `running` is
    /// cleared: accumulate touched rows up to `max_merge_var_num`, run one
    /// send/recv round across every registered variable, clear the
    /// accumulated count, repeat.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_forever<R: RpcClient>(
        &self,
        rpc: &R,
        local: &Scope,
        send_scope: &Scope,
        pserver_scope: &Scope,
        max_merge_var_num: usize,
        send_wait_times: usize,
        running: &AtomicBool,
    ) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }

            let batch = self.wait_batch(max_merge_var_num, send_wait_times, running).await;

            if !running.load(Ordering::SeqCst) {
                return;
            }
            if batch == 0 {
                info!("GEO batch is 0, skipping this round");
                continue;
            }

            self.batches.store(0, Ordering::SeqCst);
            if let Err(err) = self.run_cycle(rpc, local, send_scope, pserver_scope).await {
                warn!(error = %err, "GEO round failed, continuing");
            }
        }
    }
}
