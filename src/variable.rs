//! The `Variable`/`Scope` data model (spec.md §3) and the wire protocol's
//! distinguished variable names (spec.md §6).

use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};
use serde::{Deserialize, Serialize};

/// A distinguished single-`int64`-element variable carrying the batch size
/// for a round. Sent first, bypasses merge, skipped in the per-variable loop.
pub const STEP_COUNTER: &str = "@PS_STEP_COUNTER@";
/// Sentinel recognized by the server's batch-barrier handler.
pub const BATCH_BARRIER_MESSAGE: &str = "BATCH_BARRIER@RECV";
/// Sentinel recognized by the server's fetch-barrier handler.
pub const FETCH_BARRIER_MESSAGE: &str = "FETCH_BARRIER@RECV";
/// Sentinel marking a round as fully complete.
pub const COMPLETE_MESSAGE: &str = "COMPLETE@RECV";
/// Sentinel requesting a get without taking part in any barrier.
pub const WITHOUT_BARRIER_MESSAGE: &str = "@WITHOUT_BARRIER@RECV";
/// Sentinel carrying the learning-rate decay step counter.
pub const LEARNING_RATE_DECAY_COUNTER: &str = "@LR_DECAY_COUNTER@";

/// Element type of a dense tensor's backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F64,
    I64,
}

/// A typed value produced by the training loop and transported by value
/// between send/receive scopes, the merge pipeline, and the RPC façade.
/// `Serialize`/`Deserialize` let an `RpcClient` implementation frame this
/// over an actual wire format without the core needing to know which one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// A contiguous, row-major N-D array.
    Dense {
        shape: Vec<usize>,
        dtype: ElementType,
        data: Vec<f32>,
    },
    /// A sparse-row tensor: `height` total rows, a subset `rows` present,
    /// and a dense `[rows.len(), width]` value tensor.
    SparseRow {
        height: u64,
        rows: Vec<u64>,
        width: usize,
        data: Vec<f32>,
    },
}

impl Variable {
    pub fn dense(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Variable::Dense { shape, dtype: ElementType::F32, data }
    }

    pub fn sparse_row(height: u64, rows: Vec<u64>, width: usize, data: Vec<f32>) -> Self {
        Variable::SparseRow { height, rows, width, data }
    }

    pub fn step_counter(batch: i64) -> Self {
        Variable::Dense { shape: vec![1], dtype: ElementType::I64, data: vec![batch as f32] }
    }

    /// Row at index `row_idx` of a dense `[rows, width]` tensor, or a sparse
    /// row by its position in `rows` (not by global row id).
    pub fn row(&self, row_idx: usize, width: usize) -> &[f32] {
        match self {
            Variable::Dense { data, .. } => &data[row_idx * width..(row_idx + 1) * width],
            Variable::SparseRow { data, .. } => &data[row_idx * width..(row_idx + 1) * width],
        }
    }

    pub fn row_mut(&mut self, row_idx: usize, width: usize) -> &mut [f32] {
        match self {
            Variable::Dense { data, .. } => &mut data[row_idx * width..(row_idx + 1) * width],
            Variable::SparseRow { data, .. } => &mut data[row_idx * width..(row_idx + 1) * width],
        }
    }
}

/// A named container of variables with ownership of their storage.
/// Lock-free from the caller's perspective; the crate's concurrent tasks
/// touch disjoint names within one iteration (spec.md §5).
#[derive(Debug, Default)]
pub struct Scope {
    vars: DashMap<String, Variable>,
}

impl Scope {
    pub fn new() -> Self {
        Scope { vars: DashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Ref<'_, String, Variable>> {
        self.vars.get(name)
    }

    pub fn get_mut(&self, name: &str) -> Option<RefMut<'_, String, Variable>> {
        self.vars.get_mut(name)
    }

    pub fn set(&self, name: impl Into<String>, var: Variable) {
        self.vars.insert(name.into(), var);
    }

    pub fn remove(&self, name: &str) -> Option<Variable> {
        self.vars.remove(name).map(|(_, v)| v)
    }

    pub fn rename(&self, from: &str, to: impl Into<String>) -> bool {
        match self.vars.remove(from) {
            Some((_, v)) => {
                self.vars.insert(to.into(), v);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
