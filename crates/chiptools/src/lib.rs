//! Standard tool library
//!
//! Adapters for the tools a flow can run out of the box, plus helpers for
//! parsing their logs and reports.

mod command;
mod exec;
pub mod report;
mod timing;

pub use command::CommandAdapter;
pub use exec::ExecInput;
pub use timing::{parse_timing_log, OpenStaTiming, TimingMetric};

use chipruntime::AdapterRegistry;
use std::sync::Arc;

/// Register all standard adapters with a registry
pub fn register_all(registry: &mut AdapterRegistry) {
    registry.register(Arc::new(CommandAdapter::new("command", "run")));
    registry.register(Arc::new(ExecInput));
    registry.register(Arc::new(OpenStaTiming));
}
