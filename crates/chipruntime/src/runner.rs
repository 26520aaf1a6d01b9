//! Lifecycle of a single node, from input collection to the persisted status.

use crate::builtin;
use crate::job::Job;
use crate::registry::AdapterRegistry;
use crate::version::check_tool_version;
use chipcore::{
    Builtin, EventEmitter, FlowNode, Manifest, MetricRecorder, NodeContext, NodeError, NodeId,
    NodeStatus, ToolAdapter,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::process::{Child, Command};

/// Terminal state of a predecessor as seen by its successors
#[derive(Debug, Clone)]
pub struct PredecessorResult {
    pub id: NodeId,
    pub status: NodeStatus,
    /// Files the predecessor left in its `outputs/`
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    pub predecessors: Vec<PredecessorResult>,
    /// Files handed to entry nodes
    pub entry_files: Arc<Vec<PathBuf>>,
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub id: NodeId,
    pub status: NodeStatus,
    pub error: Option<NodeError>,
    pub outputs: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Select,
    CollectInputs,
    Setup,
    VersionCheck,
    PreProcess,
    Execute,
    PostProcess,
    Merge,
    Finalize,
}

impl Stage {
    fn first(node: &FlowNode) -> Stage {
        match node.builtin {
            Some(b) if b.is_selection() => Stage::Select,
            _ => Stage::CollectInputs,
        }
    }

    fn next(self, node: &FlowNode) -> Option<Stage> {
        match self {
            Stage::Select => Some(Stage::CollectInputs),
            Stage::CollectInputs if node.is_builtin() => Some(Stage::Merge),
            Stage::CollectInputs => Some(Stage::Setup),
            Stage::Setup => Some(Stage::VersionCheck),
            Stage::VersionCheck => Some(Stage::PreProcess),
            Stage::PreProcess => Some(Stage::Execute),
            Stage::Execute => Some(Stage::PostProcess),
            Stage::PostProcess | Stage::Merge => Some(Stage::Finalize),
            Stage::Finalize => None,
        }
    }
}

/// Why `node` cannot run given its predecessors' results, if it cannot.
///
/// Selection builtins need one successful predecessor; every other node
/// needs all of them.
pub fn skip_reason(node: &FlowNode, predecessors: &[PredecessorResult]) -> Option<String> {
    let failed: Vec<String> = predecessors
        .iter()
        .filter(|p| p.status != NodeStatus::Success)
        .map(|p| p.id.to_string())
        .collect();
    if failed.is_empty() {
        return None;
    }
    let selection = node.builtin.map_or(false, |b| b.is_selection());
    if selection && failed.len() < predecessors.len() {
        return None;
    }
    Some(format!("predecessor(s) did not succeed: {}", failed.join(", ")))
}

/// Runs one node through its stages inside its own job directory
pub struct NodeRunner {
    registry: Arc<AdapterRegistry>,
    job: Arc<Job>,
    manifest: Arc<Manifest>,
    metrics: Arc<MetricRecorder>,
    kill_grace: Duration,
}

impl NodeRunner {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        job: Arc<Job>,
        manifest: Arc<Manifest>,
        metrics: Arc<MetricRecorder>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            registry,
            job,
            manifest,
            metrics,
            kill_grace,
        }
    }

    /// Run `node` to a terminal state. Never fails: errors end up in the
    /// outcome and in the node's `status.json`, which reads `running` while
    /// the node is in flight. The caller has already checked the node's
    /// predecessors with [`skip_reason`].
    pub async fn run(&self, node: &FlowNode, inputs: NodeInputs, events: EventEmitter) -> NodeOutcome {
        let start = Instant::now();
        let result = self.lifecycle(node, &inputs, events, start).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, error, outputs) = match result {
            Ok(outputs) => (NodeStatus::Success, None, outputs),
            Err(e) => {
                tracing::error!("{} failed: {}", node.id, e);
                (NodeStatus::Failed, Some(e), Vec::new())
            }
        };

        let message = error.as_ref().map(|e| e.to_string());
        if let Err(e) = self.job.record_status(&node.id, status, message, &outputs).await {
            tracing::warn!("{}: unable to write status: {}", node.id, e);
        }
        let records = self.metrics.node_records(&node.id.step, &node.id.index);
        if let Err(e) = self.job.write_metrics(&node.id, &records).await {
            tracing::warn!("{}: unable to write metrics: {}", node.id, e);
        }

        NodeOutcome {
            id: node.id.clone(),
            status,
            error,
            outputs,
            duration_ms,
        }
    }

    async fn lifecycle(
        &self,
        node: &FlowNode,
        inputs: &NodeInputs,
        events: EventEmitter,
        start: Instant,
    ) -> Result<Vec<String>, NodeError> {
        let adapter = match node.builtin {
            Some(_) => None,
            None => Some(self.registry.get(&node.tool, &node.task)?),
        };

        let workdir = self.job.prepare_node_dir(&node.id).await?;
        self.job
            .record_status(&node.id, NodeStatus::Running, None, &[])
            .await
            .map_err(|e| NodeError::Io(format!("unable to write status: {}", e)))?;
        let ctx = NodeContext {
            id: node.id.clone(),
            tool: node.tool.clone(),
            task: node.task.clone(),
            design: self.job.design.clone(),
            workdir,
            manifest: self.manifest.clone(),
            metrics: self.metrics.clone(),
            events,
        };

        let mut sources: Vec<&PredecessorResult> = inputs
            .predecessors
            .iter()
            .filter(|p| p.status == NodeStatus::Success)
            .collect();
        let mut collected = Vec::new();
        let mut outputs = Vec::new();

        let mut stage = Some(Stage::first(node));
        while let Some(current) = stage {
            tracing::debug!("{}: {:?}", node.id, current);
            match current {
                Stage::Select => {
                    let kind = node.builtin.unwrap_or(Builtin::Nop);
                    sources = builtin::select_inputs(
                        kind,
                        node,
                        &inputs.predecessors,
                        &self.metrics,
                        &self.registry,
                    )?;
                    let chosen: Vec<String> = sources.iter().map(|p| p.id.to_string()).collect();
                    self.manifest
                        .set(&["record", "select", ctx.step(), ctx.index()], chosen);
                }
                Stage::CollectInputs => {
                    collected = self.collect_inputs(node, &ctx, &sources, inputs).await?;
                }
                Stage::Setup => {
                    required(&adapter)?.setup(&ctx).await?;
                }
                Stage::VersionCheck => {
                    check_tool_version(&ctx, required(&adapter)?).await?;
                }
                Stage::PreProcess => {
                    required(&adapter)?.pre_process(&ctx).await?;
                }
                Stage::Execute => {
                    self.execute(&ctx, required(&adapter)?).await?;
                }
                Stage::PostProcess => {
                    required(&adapter)?.post_process(&ctx).await?;
                }
                Stage::Merge => {
                    for name in &collected {
                        fs::copy(ctx.inputs_dir().join(name), ctx.outputs_dir().join(name)).await?;
                    }
                }
                Stage::Finalize => {
                    let declared = if node.is_builtin() {
                        collected.clone()
                    } else {
                        declared_outputs(node, &ctx)
                    };
                    outputs = self.finalize(&ctx, declared, start).await?;
                }
            }
            stage = current.next(node);
        }

        Ok(outputs)
    }

    /// Copy the outputs of `sources` (or the entry files) into `inputs/`.
    async fn collect_inputs(
        &self,
        node: &FlowNode,
        ctx: &NodeContext,
        sources: &[&PredecessorResult],
        inputs: &NodeInputs,
    ) -> Result<Vec<String>, NodeError> {
        let mut files: Vec<PathBuf> = Vec::new();
        if node.inputs.is_empty() {
            files.extend(inputs.entry_files.iter().cloned());
        }
        for pred in sources {
            let dir = self.job.outputs_dir(&pred.id);
            files.extend(pred.outputs.iter().map(|name| dir.join(name)));
        }

        let dest = ctx.inputs_dir();
        let mut collected: Vec<String> = Vec::new();
        for src in files {
            let name = file_name(&src)?;
            if collected.contains(&name) {
                tracing::warn!("{}: input {} provided more than once, keeping the last", ctx.id, name);
            } else {
                collected.push(name.clone());
            }
            fs::copy(&src, dest.join(&name)).await.map_err(|e| {
                NodeError::Io(format!("unable to copy {}: {}", src.display(), e))
            })?;
        }
        tracing::debug!("{}: collected {} input(s)", ctx.id, collected.len());
        Ok(collected)
    }

    async fn execute(&self, ctx: &NodeContext, adapter: &dyn ToolAdapter) -> Result<(), NodeError> {
        let exe = ctx.executable().ok_or_else(|| {
            NodeError::Configuration(format!("Tool '{}' has no executable configured", ctx.tool))
        })?;
        let mut args = ctx.task_strings("option");
        args.extend(adapter.runtime_options(ctx).await?);
        let command = std::iter::once(exe.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let log_path = ctx.log_path();
        let log = fs::File::create(&log_path).await?.into_std().await;
        let stderr = log.try_clone()?;

        let mut cmd = Command::new(&exe);
        cmd.args(&args)
            .current_dir(&ctx.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        // own process group, so a timeout reaches everything the tool started
        #[cfg(unix)]
        cmd.process_group(0);
        let env_root = ["tool", ctx.tool.as_str(), "task", ctx.task.as_str(), "env"];
        for name in ctx.manifest.getkeys(&env_root) {
            let keypath = ["tool", &ctx.tool, "task", &ctx.task, "env", &name, ctx.step(), ctx.index()];
            if let Some(value) = ctx.manifest.get(&keypath) {
                cmd.env(&name, value.to_string());
            }
        }

        tracing::info!("{}: running {}", ctx.id, command);
        ctx.events.info(format!("Running {}", command));
        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::Io(format!("unable to start '{}': {}", exe, e)))?;

        let limit = ctx.task_get("timeout").and_then(|v| v.as_f64()).filter(|s| *s > 0.0);
        let status = match limit {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs_f64(seconds), child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!("{}: timed out after {}s, stopping {}", ctx.id, seconds, exe);
                        self.terminate(ctx, &mut child).await;
                        return Err(NodeError::Timeout {
                            seconds: seconds.ceil() as u64,
                        });
                    }
                }
            }
            None => child.wait().await?,
        };

        ctx.record_metric(
            "exetime",
            started.elapsed().as_secs_f64(),
            vec![log_path.clone()],
            Some("s"),
        );

        if !status.success() {
            return Err(NodeError::SubprocessExecution {
                command,
                code: status.code(),
                log: log_path.display().to_string(),
            });
        }
        Ok(())
    }

    /// SIGTERM the tool's process group, then SIGKILL whatever is left once
    /// the grace period runs out.
    async fn terminate(&self, ctx: &NodeContext, child: &mut Child) {
        if let Some(pid) = child.id() {
            signal_group(pid, "TERM").await;
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("{}: tool exited with {} after SIGTERM", ctx.id, status);
                    signal_group(pid, "KILL").await;
                    return;
                }
                Ok(Err(e)) => tracing::warn!("{}: waiting for the tool failed: {}", ctx.id, e),
                Err(_) => tracing::warn!(
                    "{}: tool still running {:?} after SIGTERM, killing it",
                    ctx.id,
                    self.kill_grace
                ),
            }
            signal_group(pid, "KILL").await;
        }
        if let Err(e) = child.start_kill() {
            tracing::debug!("{}: kill failed: {}", ctx.id, e);
        }
        if let Err(e) = child.wait().await {
            tracing::warn!("{}: unable to reap the tool: {}", ctx.id, e);
        }
    }

    async fn finalize(
        &self,
        ctx: &NodeContext,
        declared: Vec<String>,
        start: Instant,
    ) -> Result<Vec<String>, NodeError> {
        let snapshot = ctx.outputs_dir().join(format!("{}.pkg.json", ctx.design));
        if let Err(e) = ctx.manifest.write_json(&snapshot) {
            tracing::warn!("{}: unable to write manifest snapshot: {}", ctx.id, e);
        }

        let outputs_dir = ctx.outputs_dir();
        let mut missing = Vec::new();
        for name in &declared {
            if !fs::try_exists(outputs_dir.join(name)).await.unwrap_or(false) {
                missing.push(name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(NodeError::MissingOutput { files: missing });
        }

        let mut provenance = Vec::new();
        let log = ctx.log_path();
        if fs::try_exists(&log).await.unwrap_or(false) {
            provenance.push(log);
        }
        ctx.record_metric("tasktime", start.elapsed().as_secs_f64(), provenance, Some("s"));
        Ok(declared)
    }
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let group = format!("-{}", pid);
    match Command::new("kill")
        .args(["-s", signal, "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if !status.success() => {
            tracing::debug!("kill -{} {} exited with {}", signal, group, status);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("unable to send SIG{} to {}: {}", signal, group, e),
    }
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) {}

fn required(adapter: &Option<Arc<dyn ToolAdapter>>) -> Result<&dyn ToolAdapter, NodeError> {
    adapter
        .as_deref()
        .ok_or_else(|| NodeError::Configuration("builtin node has no adapter".to_string()))
}

/// Outputs from the flowgraph plus `tool,<tool>,task,<task>,output,<step>,<index>`.
fn declared_outputs(node: &FlowNode, ctx: &NodeContext) -> Vec<String> {
    let mut declared = node.outputs.clone();
    for name in ctx.task_strings("output") {
        if !declared.contains(&name) {
            declared.push(name);
        }
    }
    declared
}

fn file_name(path: &Path) -> Result<String, NodeError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| NodeError::Io(format!("{} is not a file", path.display())))
}
