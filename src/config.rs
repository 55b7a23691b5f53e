//! Configuration loading: the string-map external interface of spec.md §6.
//!
//! Mirrors the teacher's `load_config` → validate pipeline, but the source
//! is always a `HashMap<String, String>` handed to the process (there is no
//! on-disk config file for this component — that's the training job's
//! launcher's job, not the communicator's).

use std::collections::HashMap;
use std::time::Duration;

use crate::communicator::Mode;
use crate::error::{CommError, CommResult};
use crate::kv::{Admission, Initializer};

/// A single `name:rows,width:init_spec` entry parsed out of `sparse_attrs`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseAttr {
    pub name: String,
    pub rows: u64,
    pub width: usize,
    pub initializer: Initializer,
}

/// Typed view over the spec.md §6 configuration keys.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    pub mode: Mode,

    /// `communicator_thread_pool_size`: bounds how many variables'
    /// send/recv tasks run concurrently (`SendPipeline`/`RecvPipeline`'s
    /// semaphores). Defaults to `num_cpus::get()` when absent.
    pub thread_pool_size: usize,
    /// `communicator_max_merge_var_num`
    pub max_merge_var_num: usize,
    /// `communicator_send_wait_times`
    pub send_wait_times: usize,
    /// `communicator_send_queue_size`
    pub send_queue_size: usize,
    /// `need_global_step`
    pub need_global_step: bool,

    /// `barrier_table_id`
    pub barrier_table_id: i32,
    /// `trainer_id`
    pub trainer_id: i32,
    /// `trainers`
    pub trainers: i32,

    /// `communicator_min_send_grad_num_before_recv` (Async only)
    pub min_send_grad_num_before_recv: usize,

    /// `pserver_endpoints` (Sync)
    pub pserver_endpoints: Vec<String>,

    /// `pserver_*_timeout_ms`
    pub pserver_timeout: Duration,
    /// `pserver_*_interval_ms`
    pub pserver_interval: Duration,

    /// `pserver_sparse_table_shard_num`
    pub sparse_table_shard_num: usize,

    /// `sparse_attrs`, parsed (GEO init only)
    pub sparse_attrs: Vec<SparseAttr>,

    /// Admission policy shared by every sparse table's `ValueBlock`
    /// (not itself a spec.md §6 key — inferred from the per-slot entry
    /// grammar `large_scale_kv.h` parses; exposed here so callers can
    /// override the default `Admission::None`).
    pub admission: Admission,

    /// Reproduce the original `GeoCommunicator`'s dense-path early return
    /// bug (spec.md §9 Open Question) instead of the corrected
    /// send-then-recv behavior. Default `false`.
    pub geo_dense_early_return_bug: bool,

    /// `communicator_is_sgd_optimizer`: whether the training loop's
    /// optimizer is plain SGD. Not re-plumbed into the main loop — the
    /// distilled spec's Non-goals exclude optimizer-specific behavior —
    /// but kept as a flag since callers may branch on it when choosing a
    /// `merge_mode` for their own variables.
    pub is_sgd_optimizer: bool,
}

/// Parses an optional config key, falling back to `default` when absent.
fn parse_or<T: std::str::FromStr>(
    envs: &HashMap<String, String>,
    key: &str,
    default: T,
) -> CommResult<T> {
    match envs.get(key) {
        Some(v) => v
            .parse()
            .map_err(|_| CommError::Config(format!("key `{key}` has invalid value `{v}`"))),
        None => Ok(default),
    }
}

impl CommunicatorConfig {
    /// Parse and validate a string map into a `CommunicatorConfig` for the
    /// given synchronization mode. Fails with `CommError::Config` on any
    /// missing or unparsable required key. Unrecognized keys are ignored.
    pub fn from_map(mode: Mode, envs: &HashMap<String, String>) -> CommResult<Self> {
        let get = |key: &str| envs.get(key).map(|s| s.as_str());

        let required = |key: &str| -> CommResult<&str> {
            get(key).ok_or_else(|| CommError::Config(format!("missing required key `{key}`")))
        };

        let thread_pool_size = parse_or(envs, "communicator_thread_pool_size", num_cpus::get())?;
        let max_merge_var_num = parse_or(envs, "communicator_max_merge_var_num", 20usize)?;
        let send_wait_times = parse_or(envs, "communicator_send_wait_times", 5usize)?;
        let send_queue_size = parse_or(envs, "communicator_send_queue_size", 20usize)?;
        let need_global_step = parse_or(envs, "need_global_step", false)?;

        let barrier_table_id: i32 = required("barrier_table_id")?
            .parse()
            .map_err(|_| CommError::Config("barrier_table_id is not an integer".into()))?;
        let trainer_id: i32 = required("trainer_id")?
            .parse()
            .map_err(|_| CommError::Config("trainer_id is not an integer".into()))?;
        let trainers: i32 = required("trainers")?
            .parse()
            .map_err(|_| CommError::Config("trainers is not an integer".into()))?;

        let min_send_grad_num_before_recv =
            parse_or(envs, "communicator_min_send_grad_num_before_recv", max_merge_var_num)?;

        let pserver_endpoints = match get("pserver_endpoints") {
            Some(s) if !s.is_empty() => s.split(',').map(|s| s.to_string()).collect(),
            _ => {
                if matches!(mode, Mode::Sync) {
                    return Err(CommError::Config(
                        "pserver_endpoints is required in Sync mode".into(),
                    ));
                }
                Vec::new()
            }
        };

        let timeout_ms = parse_or(envs, "pserver_timeout_ms", 10_000u64)?;
        let interval_ms = parse_or(envs, "pserver_interval_ms", 10u64)?;

        let sparse_table_shard_num = parse_or(envs, "pserver_sparse_table_shard_num", 1usize)?;

        let sparse_attrs = match get("sparse_attrs") {
            Some(s) if !s.is_empty() => parse_sparse_attrs(s)?,
            _ => Vec::new(),
        };

        Ok(CommunicatorConfig {
            mode,
            thread_pool_size,
            max_merge_var_num,
            send_wait_times,
            send_queue_size,
            need_global_step,
            barrier_table_id,
            trainer_id,
            trainers,
            min_send_grad_num_before_recv,
            pserver_endpoints,
            pserver_timeout: Duration::from_millis(timeout_ms),
            pserver_interval: Duration::from_millis(interval_ms),
            sparse_table_shard_num,
            sparse_attrs,
            admission: Admission::None,
            geo_dense_early_return_bug: parse_or(envs, "geo_dense_early_return_bug", false)?,
            is_sgd_optimizer: parse_or(envs, "communicator_is_sgd_optimizer", false)?,
        })
    }
}

/// Parses the `name:rows,width:init_spec` `#`-separated grammar
/// (`large_scale_kv.h`'s initializer wiring) used by GEO's `InitSparse`.
fn parse_sparse_attrs(raw: &str) -> CommResult<Vec<SparseAttr>> {
    raw.split('#')
        .filter(|s| !s.is_empty())
        .map(parse_one_sparse_attr)
        .collect()
}

fn parse_one_sparse_attr(entry: &str) -> CommResult<SparseAttr> {
    let bad = || CommError::Config(format!("malformed sparse_attrs entry `{entry}`"));

    let mut parts = entry.splitn(3, ':');
    let name = parts.next().ok_or_else(bad)?.to_string();
    let dims = parts.next().ok_or_else(bad)?;
    let init_spec = parts.next().ok_or_else(bad)?;

    let mut dims = dims.splitn(2, ',');
    let rows: u64 = dims.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let width: usize = dims.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;

    let initializer = Initializer::parse(init_spec).map_err(|_| bad())?;

    Ok(SparseAttr { name, rows, width, initializer })
}
