use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type JobId = Uuid;

/// Events emitted while a flow runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        job_id: JobId,
        flow: String,
        nodes: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        job_id: JobId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        job_id: JobId,
        node: NodeId,
        tool: String,
        task: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        job_id: JobId,
        node: NodeId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        job_id: JobId,
        node: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        job_id: JobId,
        node: NodeId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        job_id: JobId,
        node: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Messages a running node reports about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
}

/// Per-node handle onto the event bus
#[derive(Clone)]
pub struct EventEmitter {
    job_id: JobId,
    node: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(job_id: JobId, node: NodeId, sender: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            job_id,
            node,
            sender,
        }
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            job_id: self.job_id,
            node: self.node.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }
}

pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, job_id: JobId, node: NodeId) -> EventEmitter {
        EventEmitter::new(job_id, node, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
