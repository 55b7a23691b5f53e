//! `VariableContext` — the immutable per-variable routing descriptor
//! (spec.md §4.D), ported from the original's `CommContext`.

use serde::{Deserialize, Serialize};

/// How a batch of same-named variables is combined before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    Add,
    Average,
}

/// Whether a variable's RPC handler sends data to the server or fetches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Send,
    Get,
}

/// Immutable per-variable descriptor: name, shard routing, height
/// sections, merge mode, and handler kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableContext {
    pub name: String,
    /// Per-shard variable names as split on the server.
    pub shard_names: Vec<String>,
    /// Endpoint (`host:port`) for each shard, parallel to `shard_names`.
    pub endpoints: Vec<String>,
    /// Row-offset of each shard in the global row space. Empty means
    /// shards are sized evenly and `shard_of` falls back to modulo.
    pub height_sections: Vec<u64>,
    /// Names this variable was derived from (e.g. gradient accumulator
    /// aliasing), kept for bookkeeping/debugging only.
    pub origin_names: Vec<String>,
    pub trainer_id: i32,
    pub merge_mode: MergeMode,
    pub handler_kind: HandlerKind,
    pub is_sparse: bool,
}

impl VariableContext {
    pub fn shard_count(&self) -> usize {
        self.shard_names.len()
    }

    /// Shard owning `row_id`: modulo partitioning when no height sections
    /// are configured, otherwise a binary search over the absolute
    /// section boundaries.
    pub fn shard_of(&self, row_id: u64) -> usize {
        if self.height_sections.is_empty() {
            (row_id as usize) % self.shard_count().max(1)
        } else {
            match self.height_sections.binary_search(&row_id) {
                Ok(idx) => idx,
                Err(idx) => idx.saturating_sub(1).min(self.shard_count() - 1),
            }
        }
    }
}
