//! Flow execution runtime
//!
//! Runs a flowgraph inside a job directory: the adapter registry, the
//! per-node lifecycle, builtin selection and the layered scheduler.

pub mod builtin;
mod job;
mod registry;
mod runner;
mod runtime;
mod scheduler;
pub mod summary;
mod version;

pub use builtin::{Candidate, MuxSelector};
pub use job::{Job, StatusRecord, RUN_FILE};
pub use registry::AdapterRegistry;
pub use runner::{skip_reason, NodeInputs, NodeOutcome, NodeRunner, PredecessorResult};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use scheduler::{FlowScheduler, NodeReport, RunResult, StatusBoard};
pub use version::check_tool_version;
