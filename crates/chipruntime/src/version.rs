use chipcore::{NodeContext, NodeError, ToolAdapter, VersionRequirement};
use std::process::Stdio;
use tokio::process::Command;

/// Query the tool's version and compare it against `tool,<tool>,version`.
///
/// Returns the version string that was recorded, or `None` when no
/// requirement is configured or `option,novercheck` is set.
pub async fn check_tool_version(
    ctx: &NodeContext,
    adapter: &dyn ToolAdapter,
) -> Result<Option<String>, NodeError> {
    let clauses = ctx.manifest.get_strings(&["tool", &ctx.tool, "version"]);
    if clauses.is_empty() {
        return Ok(None);
    }
    if ctx.manifest.get_bool(&["option", "novercheck"]).unwrap_or(false) {
        tracing::debug!("{}: version check disabled", ctx.id);
        return Ok(None);
    }

    let spec = clauses.join(",");
    let requirement: VersionRequirement = spec
        .parse()
        .map_err(|e| NodeError::Configuration(format!("{}", e)))?;

    let exe = ctx.executable().ok_or_else(|| {
        NodeError::Configuration(format!("Tool '{}' has no executable configured", ctx.tool))
    })?;
    let switches = ctx.manifest.get_strings(&["tool", &ctx.tool, "vswitch"]);

    tracing::debug!("{}: querying version with {} {}", ctx.id, exe, switches.join(" "));
    let output = Command::new(&exe)
        .args(&switches)
        .current_dir(&ctx.workdir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| NodeError::ToolVersionQuery {
            tool: ctx.tool.clone(),
            code: None,
            output: format!("unable to run '{}': {}", exe, e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        tracing::error!("Tool '{}' responded with: {}", exe, stdout.trim_end());
        return Err(NodeError::ToolVersionQuery {
            tool: ctx.tool.clone(),
            code: output.status.code(),
            output: stdout,
        });
    }

    let found = adapter.parse_version(&stdout).unwrap_or_default();
    if !requirement.matches_str(&found) {
        return Err(NodeError::ToolVersionMismatch {
            tool: ctx.tool.clone(),
            found,
            requirement: requirement.to_string(),
        });
    }

    tracing::info!("{}: {} version {} satisfies {}", ctx.id, ctx.tool, found, requirement);
    ctx.manifest
        .set(&["record", "toolversion", ctx.step(), ctx.index()], found.as_str());
    Ok(Some(found))
}
