//! Core abstractions for the chip flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the flowgraph, the manifest store, the tool
//! adapter interface, metric records and version requirements. It does not
//! run anything.

mod error;
pub mod events;
pub mod flowgraph;
mod manifest;
mod metrics;
mod node;
pub mod units;
mod value;
pub mod version;

pub use error::{FlowError, GraphError, MetricError, NodeError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, JobId, NodeEvent};
pub use flowgraph::{Builtin, FlowGraph, FlowNode, NodeId, TopologicalLayers, BUILTIN_TOOL};
pub use manifest::Manifest;
pub use metrics::{MetricRecord, MetricRecorder};
pub use node::{AdapterInfo, NodeContext, NodeStatus, ToolAdapter};
pub use value::Value;
pub use version::{Version, VersionRequirement};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
