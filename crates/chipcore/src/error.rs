use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Flowgraph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems with a flowgraph. Always fatal before execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node {step}/{index} is already defined")]
    DuplicateNode { step: String, index: String },

    #[error("Node {step}/{index} is not defined")]
    UnknownNode { step: String, index: String },

    #[error("Cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Edge {from} -> {to} references a missing node")]
    DanglingEdge { from: String, to: String },

    #[error("Flowgraph '{0}' has no nodes")]
    EmptyGraph(String),

    #[error("Flowgraph '{0}' has no entry node")]
    NoEntryPoint(String),
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Tool '{tool}' version query failed (exit code {code:?}), tool responded with: {output}")]
    ToolVersionQuery {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Version check failed for '{tool}': found {found}, requires {requirement}")]
    ToolVersionMismatch {
        tool: String,
        found: String,
        requirement: String,
    },

    #[error("Command '{command}' failed with exit code {code:?}, see {log}")]
    SubprocessExecution {
        command: String,
        code: Option<i32>,
        log: String,
    },

    #[error("Missing outputs: {}", .files.join(", "))]
    MissingOutput { files: Vec<String> },

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("No successful candidate among {0} inputs")]
    NoCandidate(usize),

    #[error("Selector '{selector}' returned {matches} matches, expected exactly one")]
    AmbiguousSelection { selector: String, matches: usize },

    #[error("No adapter registered for {tool}/{task}")]
    UnknownAdapter { tool: String, task: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Metric '{metric}' not recorded for {step}/{index}")]
    NotFound {
        step: String,
        index: String,
        metric: String,
    },

    #[error("Unable to parse metric '{metric}': {message}")]
    Parsing { metric: String, message: String },

    #[error("Unit '{unit}' cannot be converted to {canonical} for metric '{metric}'")]
    UnitMismatch {
        metric: String,
        unit: String,
        canonical: String,
    },

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),
}
