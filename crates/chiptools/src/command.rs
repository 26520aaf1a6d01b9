use crate::report::read_lossy;
use async_trait::async_trait;
use chipcore::{AdapterInfo, MetricError, NodeContext, NodeError, ToolAdapter};
use once_cell::sync::Lazy;
use regex::Regex;

/// `SC_METRIC: <name> <value> [unit]`
static METRIC_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^SC_METRIC:\s+(\w+)\s+(\S+)(?:\s+(\S+))?\s*$").unwrap());

/// Runs whatever executable the manifest configures for its tool.
///
/// The command line is `tool,<tool>,exe` plus the node's `option` list;
/// lines of the form `SC_METRIC: <name> <value> [unit]` in the log are
/// recorded as metrics.
pub struct CommandAdapter {
    tool: String,
    task: String,
}

impl CommandAdapter {
    pub fn new(tool: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            task: task.into(),
        }
    }
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    fn tool(&self) -> &str {
        &self.tool
    }

    fn task(&self) -> &str {
        &self.task
    }

    async fn setup(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        if ctx.executable().is_none() {
            return Err(NodeError::Configuration(format!(
                "set tool,{},exe to the command {} should run",
                ctx.tool, ctx.id
            )));
        }
        ctx.task_set_default("option", Vec::<String>::new());
        Ok(())
    }

    async fn post_process(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let log = ctx.log_path();
        let text = read_lossy(&log)?;
        for caps in text.lines().filter_map(|l| METRIC_LINE.captures(l)) {
            let metric = &caps[1];
            match caps[2].parse::<f64>() {
                Ok(value) => {
                    ctx.record_metric(metric, value, vec![log.clone()], caps.get(3).map(|m| m.as_str()));
                }
                Err(e) => {
                    let err = MetricError::Parsing {
                        metric: metric.to_string(),
                        message: format!("'{}': {}", &caps[2], e),
                    };
                    tracing::warn!("{}: {}", ctx.id, err);
                    ctx.events.warn(err.to_string());
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> AdapterInfo {
        AdapterInfo {
            description: "Run a configured command and collect SC_METRIC lines".to_string(),
            category: "general".to_string(),
        }
    }
}
