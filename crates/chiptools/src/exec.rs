use async_trait::async_trait;
use chipcore::{AdapterInfo, NodeContext, NodeError, ToolAdapter};
use std::path::PathBuf;

/// Executes the file the previous step produced (`execute/exec_input`).
/// Only meaningful when the node receives a single file.
pub struct ExecInput;

impl ExecInput {
    /// First file in `inputs/`, ignoring manifest snapshots
    fn find_executable(ctx: &NodeContext) -> Result<Option<PathBuf>, NodeError> {
        let pattern = ctx.inputs_dir().join("*");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| NodeError::Configuration(format!("bad input pattern: {}", e)))?;
        for entry in paths {
            let path = entry.map_err(|e| NodeError::Io(e.to_string()))?;
            if path.to_string_lossy().ends_with(".pkg.json") || !path.is_file() {
                continue;
            }
            return Ok(Some(path));
        }
        Ok(None)
    }
}

#[async_trait]
impl ToolAdapter for ExecInput {
    fn tool(&self) -> &str {
        "execute"
    }

    fn task(&self) -> &str {
        "exec_input"
    }

    async fn setup(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.task_set_default("option", Vec::<String>::new());
        Ok(())
    }

    async fn pre_process(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let exe = Self::find_executable(ctx)?.ok_or_else(|| {
            NodeError::Configuration(format!("{} did not receive an executable file", ctx.id))
        })?;
        let exe = std::fs::canonicalize(&exe)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o700))?;
        }

        tracing::debug!("{}: executing {}", ctx.id, exe.display());
        ctx.task_set("exe", exe.to_string_lossy().into_owned());
        Ok(())
    }

    fn describe(&self) -> AdapterInfo {
        AdapterInfo {
            description: "Execute the file received from the previous step".to_string(),
            category: "execute".to_string(),
        }
    }
}
