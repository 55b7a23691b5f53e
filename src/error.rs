//! Error types for the communicator.

use thiserror::Error;

/// Result type used throughout the crate.
pub type CommResult<T> = Result<T, CommError>;

/// Comprehensive error type for the communicator.
#[derive(Error, Debug)]
pub enum CommError {
    /// A required configuration key was missing or could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// An input violated a stated invariant (empty merge list, shape
    /// mismatch, unknown barrier kind, `Init` of an existing key, ...).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A scope lookup for an expected variable returned absent at a point
    /// where it must be present.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// A transport future returned non-zero or timed out.
    #[error("rpc error: {0} (status {1})")]
    Rpc(String, i32),

    /// `BarrierMonitor` exceeded `kMaxWaitMS` waiting for all workers.
    #[error("barrier timeout waiting for workers")]
    BarrierTimeout,

    /// A key was not found in a `ValueBlock` or `Scope` lookup.
    #[error("not found: {0}")]
    NotFound(String),

    /// A key already existed when an `Init` expected it to be absent.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}
