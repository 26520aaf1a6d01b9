//! Helpers shared by post-processing parsers.

use chipcore::{NodeContext, NodeError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(-?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)").unwrap());

/// Read a log or report, replacing invalid UTF-8.
pub fn read_lossy(path: &Path) -> Result<String, NodeError> {
    let bytes = std::fs::read(path)
        .map_err(|e| NodeError::Io(format!("unable to read {}: {}", path.display(), e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Number at the start of `line`, if any
pub fn leading_number(line: &str) -> Option<f64> {
    LEADING_NUMBER
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The node's log followed by those of `reports` (relative to the node
/// directory) that exist.
pub fn provenance(ctx: &NodeContext, reports: &[String]) -> Vec<PathBuf> {
    let mut paths = vec![ctx.log_path()];
    paths.extend(reports.iter().map(|r| ctx.path(r)).filter(|p| p.is_file()));
    paths
}

/// Lines of `path` matching `pattern`; zero if the file is missing.
pub fn count_matches(path: &Path, pattern: &Regex) -> Result<usize, NodeError> {
    if !path.is_file() {
        return Ok(0);
    }
    Ok(read_lossy(path)?.lines().filter(|l| pattern.is_match(l)).count())
}
