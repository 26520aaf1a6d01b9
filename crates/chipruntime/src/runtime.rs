use crate::job::Job;
use crate::registry::AdapterRegistry;
use crate::scheduler::{FlowScheduler, RunResult, StatusBoard};
use chipcore::{EventBus, ExecutionEvent, FlowError, FlowGraph, Manifest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing flows
pub struct FlowRuntime {
    registry: Arc<AdapterRegistry>,
    scheduler: FlowScheduler,
    event_bus: Arc<EventBus>,
    cancellation: CancellationToken,
}

impl FlowRuntime {
    /// Create a runtime with an empty registry and default settings
    pub fn new() -> Self {
        Self::with_registry(Arc::new(AdapterRegistry::new()), RuntimeConfig::default())
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<AdapterRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            scheduler: FlowScheduler::new(config),
            event_bus,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Run `graph` in `job`. Entry nodes receive copies of `entry_inputs`.
    pub async fn run(
        &self,
        graph: &FlowGraph,
        job: Job,
        manifest: Arc<Manifest>,
        entry_inputs: Vec<PathBuf>,
    ) -> Result<RunResult, FlowError> {
        self.scheduler
            .execute(
                graph,
                self.registry.clone(),
                &self.event_bus,
                Arc::new(job),
                manifest,
                entry_inputs,
                &self.cancellation,
            )
            .await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Live per-node status of the current or last run
    pub fn status_board(&self) -> StatusBoard {
        self.scheduler.board().clone()
    }

    /// Token that stops the dispatch of further nodes when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel: usize,
    /// Stop dispatching after the first failed node
    pub fail_fast: bool,
    /// Reuse nodes that succeeded in a previous run of the same job
    pub resume: bool,
    pub event_buffer_size: usize,
    /// How long a timed out tool may take to exit after SIGTERM
    pub kill_grace: Duration,
    /// Steps to run; empty runs the whole flow
    pub steplist: Vec<String>,
}

impl RuntimeConfig {
    /// Defaults overridden by `option,jobs`, `option,failfast`,
    /// `option,resume` and `option,steplist` when present.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut config = Self::default();
        if let Some(jobs) = manifest.get_f64(&["option", "jobs"]) {
            if jobs >= 1.0 {
                config.max_parallel = jobs as usize;
            }
        }
        if let Some(fail_fast) = manifest.get_bool(&["option", "failfast"]) {
            config.fail_fast = fail_fast;
        }
        if let Some(resume) = manifest.get_bool(&["option", "resume"]) {
            config.resume = resume;
        }
        config.steplist = manifest.get_strings(&["option", "steplist"]);
        config
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            fail_fast: false,
            resume: false,
            event_buffer_size: 1000,
            kill_grace: Duration::from_secs(5),
            steplist: Vec::new(),
        }
    }
}
