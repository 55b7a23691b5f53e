//! `BarrierMonitor` — the server-side admission gate for worker batches in
//! send/recv phases (spec.md §4.I), ported from the original
//! `barrier_monitor.cc`.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{CommError, CommResult};

/// Which barrier a worker is calling in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    Batch,
    Fetch,
}

/// The phase the monitor currently admits workers into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Send,
    Recv,
}

/// The monitor's per-round clamp: 1ms polls, this many of them before a
/// phase is declared timed out and invalidated (spec.md §9 Open Question
/// #2 resolution — see DESIGN.md).
pub const K_MAX_WAIT_MS: u64 = 10_000;

struct Inner {
    phase: Phase,
    send_queue: Vec<i32>,
    recv_queue: Vec<i32>,
    workers: i32,
    valid: bool,
    release: bool,
    working: bool,
    running: bool,
}

/// Counts per-phase worker arrivals, swaps send/recv phases, times out,
/// and wakes workers. One instance is shared by every request handler on
/// a parameter-server shard.
pub struct BarrierMonitor {
    inner: Mutex<Inner>,
    worker_cv: Condvar,
    server_cv: Condvar,
}

impl BarrierMonitor {
    pub fn new(workers: i32) -> Self {
        BarrierMonitor {
            inner: Mutex::new(Inner {
                phase: Phase::Send,
                send_queue: Vec::new(),
                recv_queue: Vec::new(),
                workers,
                valid: true,
                release: false,
                working: false,
                running: true,
            }),
            worker_cv: Condvar::new(),
            server_cv: Condvar::new(),
        }
    }

    /// Pushes `worker_id` onto the queue for `kind`, then blocks until the
    /// round resolves. Returns whether the round was valid (`false` on
    /// timeout).
    pub fn increase_barrier(&self, worker_id: i32, kind: BarrierKind) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.working = true;
            inner.release = false;
            match kind {
                BarrierKind::Batch => inner.send_queue.push(worker_id),
                BarrierKind::Fetch => inner.recv_queue.push(worker_id),
            }
        }
        self.worker_cv.notify_all();
        self.wait()
    }

    /// Blocks until the round releases; returns the round's validity.
    pub fn wait(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        let guard = self.worker_cv.wait_while(guard, |i| !i.release).unwrap();
        guard.valid
    }

    fn is_ready(&self, inner: &Inner) -> bool {
        match inner.phase {
            Phase::Send => inner.send_queue.len() as i32 == inner.workers,
            Phase::Recv => inner.recv_queue.len() as i32 == inner.workers,
        }
    }

    /// Flips `phase`, clears the just-drained queue, marks the round
    /// valid, and wakes every waiting worker.
    fn swap(&self, inner: &mut Inner) {
        // The original signals a second, server-side condvar and waits on
        // it before flipping phase; no other party in this port notifies
        // that condvar, so the handshake would deadlock if reproduced
        // literally. We keep `server_cv` for API parity (see
        // `wait_for_server_wakeup`) but the monitor thread itself does not
        // block on it — there is nothing else driving this process.
        self.server_cv.notify_all();

        inner.valid = true;
        inner.release = true;
        match inner.phase {
            Phase::Send => {
                inner.phase = Phase::Recv;
                inner.send_queue.clear();
            }
            Phase::Recv => {
                inner.phase = Phase::Send;
                inner.recv_queue.clear();
            }
        }
    }

    fn invalidate(&self, inner: &mut Inner) {
        inner.valid = false;
        inner.release = true;
        inner.send_queue.clear();
        inner.recv_queue.clear();
    }

    /// Lowers the expected-workers count, e.g. when a worker announces it
    /// is done for good.
    pub fn decrease_worker(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.workers -= 1;
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().running = false;
    }

    /// Runs one monitor round synchronously: waits (via 1ms polling, up to
    /// `K_MAX_WAIT_MS` polls) for the current phase to fill, then swaps;
    /// invalidates the round on timeout. Intended to be driven from a
    /// dedicated monitor thread in a loop, mirroring the original's
    /// `Monitor()` — split out here so it is testable without sleeping for
    /// the full idle/timeout windows.
    pub fn run_round_blocking(&self) {
        self.run_round_with_budget(K_MAX_WAIT_MS)
    }

    /// `run_round_blocking` parameterized over the number of 1ms polls to
    /// attempt before invalidating, so tests can exercise the timeout path
    /// without a real ~10s wait.
    fn run_round_with_budget(&self, max_polls: u64) {
        for _ in 0..max_polls {
            {
                let mut inner = self.inner.lock().unwrap();
                if self.is_ready(&inner) {
                    self.swap(&mut inner);
                    drop(inner);
                    self.worker_cv.notify_all();
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut inner = self.inner.lock().unwrap();
        self.invalidate(&mut inner);
        drop(inner);
        self.worker_cv.notify_all();
    }

    /// The monitor loop proper: idles in 1200ms steps until the first
    /// worker arrives, then repeatedly runs rounds until `stop()`.
    pub fn monitor_loop(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.working {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1200));
        }

        loop {
            {
                let inner = self.inner.lock().unwrap();
                if !inner.running {
                    break;
                }
            }
            self.run_round_blocking();
        }
    }
}

/// Parses a wire-level barrier kind string into `BarrierKind`. Unknown
/// kinds are a fatal `ContractViolation` (spec.md §7) at this RPC dispatch
/// boundary rather than inside the monitor, whose `BarrierKind` parameter
/// is already exhaustive.
pub fn parse_barrier_kind(raw: &str) -> CommResult<BarrierKind> {
    match raw {
        "BATCH_BARRIER_MESSAGE" => Ok(BarrierKind::Batch),
        "FETCH_BARRIER_MESSAGE" => Ok(BarrierKind::Fetch),
        other => Err(CommError::ContractViolation(format!("unknown barrier kind `{other}`"))),
    }
}
