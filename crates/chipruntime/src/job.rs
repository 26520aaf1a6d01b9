//! On-disk layout of one run: `<root>/<step>/<index>/{inputs,outputs,reports}`
//! plus per-node status and metric files. Nothing here ever deletes the job
//! root; only a node's own directory is reset before that node re-runs.

use chipcore::{FlowError, JobId, MetricRecord, NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const STATUS_FILE: &str = "status.json";
const METRICS_FILE: &str = "metrics.json";
pub const RUN_FILE: &str = "run.json";

/// Terminal state of a node as persisted in its directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: NodeStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Output filenames present in `outputs/` when the node finished
    #[serde(default)]
    pub outputs: Vec<String>,
    /// When the status was last written
    #[serde(alias = "finished_at")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub root: PathBuf,
    pub design: String,
}

impl Job {
    pub fn new(root: impl Into<PathBuf>, design: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            root: root.into(),
            design: design.into(),
        }
    }

    pub fn node_dir(&self, id: &NodeId) -> PathBuf {
        self.root.join(&id.step).join(&id.index)
    }

    pub fn outputs_dir(&self, id: &NodeId) -> PathBuf {
        self.node_dir(id).join("outputs")
    }

    pub fn log_path(&self, id: &NodeId) -> PathBuf {
        self.node_dir(id).join(format!("{}.log", id.step))
    }

    /// Create a clean node directory with its `inputs/`, `outputs/` and
    /// `reports/` subdirectories.
    pub async fn prepare_node_dir(&self, id: &NodeId) -> std::io::Result<PathBuf> {
        let dir = self.node_dir(id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        for sub in ["inputs", "outputs", "reports"] {
            fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(dir)
    }

    pub async fn record_status(
        &self,
        id: &NodeId,
        status: NodeStatus,
        error: Option<String>,
        outputs: &[String],
    ) -> Result<(), FlowError> {
        let record = StatusRecord {
            status,
            error,
            outputs: outputs.to_vec(),
            updated_at: Utc::now(),
        };
        self.write_json(&self.node_dir(id).join(STATUS_FILE), &record).await
    }

    pub async fn recorded_status(&self, id: &NodeId) -> Option<StatusRecord> {
        self.read_json(&self.node_dir(id).join(STATUS_FILE)).await.ok()
    }

    /// True if the node previously succeeded and every output it reported
    /// is still on disk.
    pub async fn is_reusable(&self, id: &NodeId) -> Option<StatusRecord> {
        let record = self.recorded_status(id).await?;
        if record.status != NodeStatus::Success {
            return None;
        }
        let outputs = self.outputs_dir(id);
        for name in &record.outputs {
            if !fs::try_exists(outputs.join(name)).await.unwrap_or(false) {
                tracing::debug!("{} cannot be reused: {} is missing", id, name);
                return None;
            }
        }
        Some(record)
    }

    pub async fn write_metrics(&self, id: &NodeId, records: &[MetricRecord]) -> Result<(), FlowError> {
        self.write_json(&self.node_dir(id).join(METRICS_FILE), &records).await
    }

    pub async fn read_metrics(&self, id: &NodeId) -> Vec<MetricRecord> {
        self.read_json(&self.node_dir(id).join(METRICS_FILE))
            .await
            .unwrap_or_default()
    }

    pub async fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), FlowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        fs::write(path, json).await?;
        Ok(())
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, FlowError> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
