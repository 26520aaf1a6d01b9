use crate::{events::EventEmitter, Manifest, MetricRecord, MetricRecorder, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hooks a tool integration provides for one `(tool, task)` pair.
///
/// The runner calls them in lifecycle order: `setup`, version check,
/// `pre_process`, execution with `runtime_options`, `post_process`. Every
/// hook except `setup` is optional.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn tool(&self) -> &str;

    fn task(&self) -> &str;

    /// Write the node's executable, switches and options into the manifest.
    async fn setup(&self, ctx: &NodeContext) -> Result<(), NodeError>;

    /// Optional: stage tool specific inputs before execution
    async fn pre_process(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: extra command-line arguments computed at run time
    async fn runtime_options(&self, _ctx: &NodeContext) -> Result<Vec<String>, NodeError> {
        Ok(Vec::new())
    }

    /// Optional: parse logs and reports, record metrics
    async fn post_process(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Extract a version string from the output of the version switch.
    /// Defaults to the first non-empty line.
    fn parse_version(&self, raw: &str) -> Option<String> {
        raw.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(String::from)
    }

    fn describe(&self) -> AdapterInfo {
        AdapterInfo::default()
    }
}

/// Human readable information about an adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub description: String,
    pub category: String,
}

impl Default for AdapterInfo {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a lifecycle hook may touch for one node
#[derive(Clone)]
pub struct NodeContext {
    pub id: NodeId,
    pub tool: String,
    pub task: String,
    pub design: String,

    /// `<jobroot>/<step>/<index>`, owned by this node alone
    pub workdir: PathBuf,

    pub manifest: Arc<Manifest>,
    pub metrics: Arc<MetricRecorder>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl NodeContext {
    pub fn step(&self) -> &str {
        &self.id.step
    }

    pub fn index(&self) -> &str {
        &self.id.index
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.workdir.join("inputs")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.workdir.join("outputs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workdir.join("reports")
    }

    /// `<step>.log` holding the tool's combined output
    pub fn log_path(&self) -> PathBuf {
        self.workdir.join(format!("{}.log", self.id.step))
    }

    /// Resolve a path relative to the node directory.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.workdir.join(relative)
    }

    fn task_keypath<'a>(&'a self, key: &'a str) -> [&'a str; 7] {
        ["tool", &self.tool, "task", &self.task, key, &self.id.step, &self.id.index]
    }

    /// `tool, <tool>, <key>`
    pub fn tool_get(&self, key: &str) -> Option<Value> {
        self.manifest.get(&["tool", &self.tool, key])
    }

    pub fn tool_set(&self, key: &str, value: impl Into<Value>) {
        self.manifest.set(&["tool", &self.tool, key], value);
    }

    pub fn tool_set_default(&self, key: &str, value: impl Into<Value>) -> bool {
        self.manifest.set_default(&["tool", &self.tool, key], value)
    }

    /// `tool, <tool>, task, <task>, <key>, <step>, <index>`
    pub fn task_get(&self, key: &str) -> Option<Value> {
        self.manifest.get(&self.task_keypath(key))
    }

    pub fn task_strings(&self, key: &str) -> Vec<String> {
        self.manifest.get_strings(&self.task_keypath(key))
    }

    pub fn task_set(&self, key: &str, value: impl Into<Value>) {
        self.manifest.set(&self.task_keypath(key), value);
    }

    pub fn task_add(&self, key: &str, value: impl Into<Value>) {
        self.manifest.add(&self.task_keypath(key), value);
    }

    pub fn task_set_default(&self, key: &str, value: impl Into<Value>) -> bool {
        self.manifest.set_default(&self.task_keypath(key), value)
    }

    /// Executable for this node: a per-node `exe` task key wins over
    /// `tool,<tool>,exe`.
    pub fn executable(&self) -> Option<String> {
        self.task_get("exe")
            .or_else(|| self.tool_get("exe"))
            .and_then(|v| v.as_str().map(String::from))
            .filter(|exe| !exe.is_empty())
    }

    /// Record a metric for this node. Failures are logged and swallowed:
    /// metric extraction never fails a node.
    pub fn record_metric(
        &self,
        metric: &str,
        value: f64,
        provenance: Vec<PathBuf>,
        unit: Option<&str>,
    ) -> Option<MetricRecord> {
        match self
            .metrics
            .record(&self.id.step, &self.id.index, metric, value, provenance, unit)
        {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("{}: {}", self.id, e);
                self.events.warn(e.to_string());
                None
            }
        }
    }
}
