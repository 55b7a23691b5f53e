//! Client-side Communicator for a parameter-server training fabric:
//! merge-and-send / receive-and-apply gradient synchronization across
//! Async, HalfAsync, and Sync disciplines, plus GEO's delta-based sparse
//! path, and the server-side `BarrierMonitor` / `LargeScaleKV` building
//! blocks the client relies on.

pub mod barrier;
pub mod communicator;
pub mod config;
pub mod context;
pub mod error;
pub mod geo;
pub mod kv;
pub mod lifecycle;
pub mod mathops;
pub mod merge;
pub mod queue;
pub mod recv;
pub mod rpc;
pub mod send;
pub mod variable;

pub use barrier::{BarrierKind, BarrierMonitor, Phase};
pub use communicator::{ClientBarrier, CommunicatorCore, Mode};
pub use config::{CommunicatorConfig, SparseAttr};
pub use context::{HandlerKind, MergeMode, VariableContext};
pub use error::{CommError, CommResult};
pub use geo::GeoEngine;
pub use kv::{Admission, Entry, Initializer, Schema, ValueBlock};
pub use lifecycle::{GeoCommunicator, StandardCommunicator};
pub use queue::BoundedQueue;
pub use recv::RecvPipeline;
pub use rpc::{RpcClient, Status, STATUS_OK};
pub use send::{SendChannel, SendPipeline};
pub use variable::{ElementType, Scope, Variable};
