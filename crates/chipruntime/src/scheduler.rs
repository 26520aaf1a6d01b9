use crate::job::{Job, RUN_FILE};
use crate::registry::AdapterRegistry;
use crate::runner::{skip_reason, NodeInputs, NodeOutcome, NodeRunner, PredecessorResult};
use crate::runtime::RuntimeConfig;
use chipcore::{
    EventBus, ExecutionEvent, FlowError, FlowGraph, FlowNode, GraphError, Manifest, MetricRecord,
    MetricRecorder, NodeError, NodeId, NodeStatus,
};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Live status of every node of the current run
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    nodes: Arc<RwLock<BTreeMap<NodeId, NodeStatus>>>,
}

impl StatusBoard {
    pub fn get(&self, id: &NodeId) -> Option<NodeStatus> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.get(id).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn reset<'a>(&self, ids: impl Iterator<Item = &'a NodeId>) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.clear();
        nodes.extend(ids.map(|id| (id.clone(), NodeStatus::Pending)));
    }

    fn set(&self, id: &NodeId, status: NodeStatus) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(id.clone(), status);
    }
}

/// Nodes a run covers when a steplist narrows it
struct Plan {
    run: BTreeSet<NodeId>,
    /// Predecessors outside the steplist taken from a previous run
    reuse: BTreeSet<NodeId>,
}

impl Plan {
    fn covers(&self, id: &NodeId) -> bool {
        self.run.contains(id) || self.reuse.contains(id)
    }
}

/// Executes a flowgraph layer by layer with bounded parallelism
pub struct FlowScheduler {
    config: RuntimeConfig,
    board: StatusBoard,
}

impl FlowScheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            board: StatusBoard::default(),
        }
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Run the nodes of `graph` inside `job` and persist the result as
    /// `<jobroot>/run.json`. With a steplist only those steps run, plus any
    /// predecessor that has no reusable result in `job`.
    ///
    /// Only structural problems are returned as errors; node failures are
    /// reported in the [`RunResult`].
    pub async fn execute(
        &self,
        graph: &FlowGraph,
        registry: Arc<AdapterRegistry>,
        event_bus: &EventBus,
        job: Arc<Job>,
        manifest: Arc<Manifest>,
        entry_inputs: Vec<PathBuf>,
        cancellation: &CancellationToken,
    ) -> Result<RunResult, FlowError> {
        graph.validate()?;
        registry.check_graph(graph)?;
        for path in &entry_inputs {
            if !path.is_file() {
                return Err(FlowError::Execution(format!(
                    "Entry input {} does not exist",
                    path.display()
                )));
            }
        }
        tokio::fs::create_dir_all(&job.root).await?;
        let plan = self.plan(graph, &job).await?;
        let covered = |id: &NodeId| plan.as_ref().map_or(true, |p| p.covers(id));
        self.board.reset(graph.node_ids().filter(|id| covered(*id)));
        let nodes = graph.node_ids().filter(|id| covered(*id)).count();

        let start = Instant::now();
        let started_at = Utc::now();
        tracing::info!(
            "Starting flow '{}' ({} nodes) in {}",
            graph.name,
            nodes,
            job.root.display()
        );
        event_bus.emit(ExecutionEvent::RunStarted {
            job_id: job.id,
            flow: graph.name.clone(),
            nodes,
            timestamp: started_at,
        });

        let metrics = Arc::new(MetricRecorder::new());
        let runner = Arc::new(NodeRunner::new(
            registry,
            job.clone(),
            manifest.clone(),
            metrics.clone(),
            self.config.kill_grace,
        ));
        let entry_files = Arc::new(entry_inputs);
        let max_parallel = self.config.max_parallel.max(1);

        let mut reports: BTreeMap<NodeId, NodeReport> = BTreeMap::new();
        let mut abort: Option<String> = None;

        for layer in graph.topological_layers() {
            tracing::debug!("Layer: {:?}", layer.iter().map(|id| id.to_string()).collect::<Vec<_>>());
            let mut pending = layer.into_iter();
            let mut running = FuturesUnordered::new();

            loop {
                while running.len() < max_parallel {
                    let Some(id) = pending.next() else { break };
                    if !covered(&id) {
                        continue;
                    }
                    if abort.is_none() && cancellation.is_cancelled() {
                        tracing::warn!("Run cancelled, no further nodes will be started");
                        abort = Some(NodeError::Cancelled.to_string());
                    }
                    if let Some(reason) = &abort {
                        let report = self.skip(event_bus, &job, &id, reason.clone());
                        reports.insert(id, report);
                        continue;
                    }

                    let node = lookup(graph, &id)?;
                    if plan.as_ref().map_or(false, |p| p.reuse.contains(&id)) {
                        if let Some(report) = self.reuse(node, &job, &metrics).await {
                            self.reused(event_bus, &job, report, &mut reports);
                            continue;
                        }
                    }
                    let predecessors = predecessor_results(node, &reports);
                    if let Some(reason) = skip_reason(node, &predecessors) {
                        let report = self.skip(event_bus, &job, &id, reason);
                        reports.insert(id, report);
                        continue;
                    }

                    if self.config.resume {
                        if let Some(report) = self.try_resume(node, &job, &metrics, &reports).await {
                            self.reused(event_bus, &job, report, &mut reports);
                            continue;
                        }
                    }

                    self.board.set(&id, NodeStatus::Running);
                    event_bus.emit(ExecutionEvent::NodeStarted {
                        job_id: job.id,
                        node: id.clone(),
                        tool: node.tool.clone(),
                        task: node.task.clone(),
                        timestamp: Utc::now(),
                    });

                    let inputs = NodeInputs {
                        predecessors,
                        entry_files: entry_files.clone(),
                    };
                    let events = event_bus.create_emitter(job.id, id.clone());
                    let runner = runner.clone();
                    let node = node.clone();
                    running.push(tokio::spawn(async move { runner.run(&node, inputs, events).await }));
                }

                let Some(joined) = running.next().await else { break };
                let outcome = joined.map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?;

                if outcome.status == NodeStatus::Failed && self.config.fail_fast && abort.is_none() {
                    tracing::warn!("{} failed, skipping every node not yet started", outcome.id);
                    abort = Some(format!("run aborted after {} failed", outcome.id));
                }
                let report = self.complete(event_bus, &job, outcome);
                reports.insert(report.id.clone(), report);
            }
        }

        // terminal within the part of the graph this run covered
        let success = graph
            .node_ids()
            .filter(|id| covered(*id))
            .filter(|id| !graph.successors(id).iter().any(|next| covered(next)))
            .all(|id| reports.get(id).map_or(false, |r| r.status == NodeStatus::Success));
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = RunResult {
            job_id: job.id,
            flow: graph.name.clone(),
            design: job.design.clone(),
            success,
            aborted: abort.is_some(),
            steplist: self.config.steplist.clone(),
            started_at,
            duration_ms,
            nodes: reports.into_values().collect(),
            metrics: metrics.snapshot(),
        };

        job.write_json(&job.root.join(RUN_FILE), &result).await?;
        manifest.write_json(&job.root.join(format!("{}.pkg.json", job.design)))?;

        tracing::info!(
            "Flow '{}' {} in {}ms",
            graph.name,
            if success { "succeeded" } else { "failed" },
            duration_ms
        );
        event_bus.emit(ExecutionEvent::RunCompleted {
            job_id: job.id,
            success,
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    /// Resolve the steplist into the nodes to run and the predecessors to
    /// take over from the job directory. `None` runs the whole graph.
    async fn plan(&self, graph: &FlowGraph, job: &Job) -> Result<Option<Plan>, FlowError> {
        if self.config.steplist.is_empty() {
            return Ok(None);
        }
        let steps = graph.steps();
        let mut run = BTreeSet::new();
        for step in &self.config.steplist {
            if !steps.contains(step) {
                return Err(FlowError::Execution(format!(
                    "Step '{}' is not part of flow '{}'",
                    step, graph.name
                )));
            }
            for index in graph.indices(step) {
                run.insert(NodeId::new(step.as_str(), index));
            }
        }

        let mut reuse = BTreeSet::new();
        let mut queue: Vec<NodeId> = run.iter().cloned().collect();
        while let Some(id) = queue.pop() {
            for pred in graph.predecessors(&id) {
                if run.contains(pred) || reuse.contains(pred) {
                    continue;
                }
                if job.is_reusable(pred).await.is_some() {
                    reuse.insert(pred.clone());
                } else {
                    tracing::info!("{} has no reusable result, adding it to the run", pred);
                    run.insert(pred.clone());
                    queue.push(pred.clone());
                }
            }
        }
        tracing::info!(
            "Steplist {:?}: running {} node(s), reusing {}",
            self.config.steplist,
            run.len(),
            reuse.len()
        );
        Ok(Some(Plan { run, reuse }))
    }

    fn reused(
        &self,
        event_bus: &EventBus,
        job: &Job,
        report: NodeReport,
        reports: &mut BTreeMap<NodeId, NodeReport>,
    ) {
        self.board.set(&report.id, NodeStatus::Success);
        event_bus.emit(ExecutionEvent::NodeCompleted {
            job_id: job.id,
            node: report.id.clone(),
            duration_ms: 0,
            timestamp: Utc::now(),
        });
        reports.insert(report.id.clone(), report);
    }

    fn skip(&self, event_bus: &EventBus, job: &Job, id: &NodeId, reason: String) -> NodeReport {
        tracing::info!("Skipping {}: {}", id, reason);
        self.board.set(id, NodeStatus::Skipped);
        event_bus.emit(ExecutionEvent::NodeSkipped {
            job_id: job.id,
            node: id.clone(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        NodeReport {
            id: id.clone(),
            status: NodeStatus::Skipped,
            error: Some(reason),
            duration_ms: 0,
            outputs: Vec::new(),
            resumed: false,
        }
    }

    fn complete(&self, event_bus: &EventBus, job: &Job, outcome: NodeOutcome) -> NodeReport {
        let error = outcome.error.as_ref().map(|e| e.to_string());
        self.board.set(&outcome.id, outcome.status);
        match (&outcome.status, &error) {
            (NodeStatus::Success, _) => {
                tracing::info!("Node {} completed in {}ms", outcome.id, outcome.duration_ms);
                event_bus.emit(ExecutionEvent::NodeCompleted {
                    job_id: job.id,
                    node: outcome.id.clone(),
                    duration_ms: outcome.duration_ms,
                    timestamp: Utc::now(),
                });
            }
            (NodeStatus::Skipped, _) => {
                event_bus.emit(ExecutionEvent::NodeSkipped {
                    job_id: job.id,
                    node: outcome.id.clone(),
                    reason: error.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                });
            }
            (_, message) => {
                event_bus.emit(ExecutionEvent::NodeFailed {
                    job_id: job.id,
                    node: outcome.id.clone(),
                    error: message.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                });
            }
        }
        NodeReport {
            id: outcome.id,
            status: outcome.status,
            error,
            duration_ms: outcome.duration_ms,
            outputs: outcome.outputs,
            resumed: false,
        }
    }

    /// Reuse a node from a previous run if it succeeded, its outputs are
    /// intact and every predecessor was reused as well.
    async fn try_resume(
        &self,
        node: &FlowNode,
        job: &Job,
        metrics: &MetricRecorder,
        reports: &BTreeMap<NodeId, NodeReport>,
    ) -> Option<NodeReport> {
        let upstream_reused = node
            .inputs
            .iter()
            .all(|pred| reports.get(pred).map_or(false, |r| r.resumed));
        if !upstream_reused {
            return None;
        }
        self.reuse(node, job, metrics).await
    }

    /// Take `node` over from the job directory if its recorded result is intact.
    async fn reuse(&self, node: &FlowNode, job: &Job, metrics: &MetricRecorder) -> Option<NodeReport> {
        let record = job.is_reusable(&node.id).await?;
        metrics.restore(job.read_metrics(&node.id).await);
        tracing::info!("Reusing {} from a previous run", node.id);
        Some(NodeReport {
            id: node.id.clone(),
            status: NodeStatus::Success,
            error: None,
            duration_ms: 0,
            outputs: record.outputs,
            resumed: true,
        })
    }
}

fn lookup<'a>(graph: &'a FlowGraph, id: &NodeId) -> Result<&'a FlowNode, GraphError> {
    graph.get(id).ok_or_else(|| GraphError::UnknownNode {
        step: id.step.clone(),
        index: id.index.clone(),
    })
}

fn predecessor_results(node: &FlowNode, reports: &BTreeMap<NodeId, NodeReport>) -> Vec<PredecessorResult> {
    node.inputs
        .iter()
        .map(|pred| match reports.get(pred) {
            Some(report) => PredecessorResult {
                id: pred.clone(),
                status: report.status,
                outputs: report.outputs.clone(),
            },
            None => PredecessorResult {
                id: pred.clone(),
                status: NodeStatus::Pending,
                outputs: Vec::new(),
            },
        })
        .collect()
}

/// Final state of one node in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Failure message, or the reason the node was skipped
    pub error: Option<String>,
    pub duration_ms: u64,
    pub outputs: Vec<String>,
    /// Taken over from a previous run without executing
    #[serde(default)]
    pub resumed: bool,
}

/// Result of a flow run, persisted as `run.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: chipcore::JobId,
    pub flow: String,
    pub design: String,
    /// Every terminal node succeeded
    pub success: bool,
    /// Dispatch stopped early through fail-fast or cancellation
    pub aborted: bool,
    /// Steps the run was restricted to; empty for the whole flow
    #[serde(default)]
    pub steplist: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub nodes: Vec<NodeReport>,
    pub metrics: Vec<MetricRecord>,
}

impl RunResult {
    pub fn report(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|r| &r.id == id)
    }

    pub fn status(&self, step: &str, index: &str) -> Option<NodeStatus> {
        self.report(&NodeId::new(step, index)).map(|r| r.status)
    }

    /// Latest value of `metric` recorded for a node
    pub fn metric(&self, step: &str, index: &str, metric: &str) -> Option<f64> {
        self.metrics
            .iter()
            .rev()
            .find(|r| r.step == step && r.index == index && r.metric == metric)
            .map(|r| r.value)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|r| r.status == status).count()
    }
}
