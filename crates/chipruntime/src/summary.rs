//! Plain text summary of a finished run.

use crate::scheduler::RunResult;
use std::fmt::Write;

/// Metrics shown as columns when any node recorded them
const HEADLINE: &[&str] = &[
    "cellarea",
    "totalarea",
    "setupslack",
    "holdslack",
    "setuptns",
    "fmax",
    "peakpower",
    "drvs",
    "exetime",
    "tasktime",
];

pub fn render(result: &RunResult) -> String {
    let columns: Vec<&str> = HEADLINE
        .iter()
        .copied()
        .filter(|m| result.metrics.iter().any(|r| r.metric == *m))
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut header = vec!["node".to_string(), "status".to_string()];
    header.extend(columns.iter().map(|c| c.to_string()));
    rows.push(header);

    for report in &result.nodes {
        let mut row = vec![report.id.to_string(), report.status.to_string()];
        if report.resumed {
            row[1].push_str(" (resumed)");
        }
        for metric in &columns {
            let cell = result
                .metric(&report.id.step, &report.id.index, metric)
                .map(format_value)
                .unwrap_or_else(|| "-".to_string());
            row.push(cell);
        }
        rows.push(row);
    }

    let widths: Vec<usize> = (0..rows[0].len())
        .map(|col| rows.iter().map(|r| r[col].len()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Flow '{}' for design '{}': {} in {:.1}s",
        result.flow,
        result.design,
        if result.success { "SUCCESS" } else { "FAILED" },
        result.duration_ms as f64 / 1000.0
    );
    if !result.steplist.is_empty() {
        let _ = writeln!(out, "Steps: {}", result.steplist.join(", "));
    }
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        let _ = writeln!(out, "  {}", line.join("  ").trim_end());
    }

    let failures: Vec<_> = result
        .nodes
        .iter()
        .filter(|r| r.status == chipcore::NodeStatus::Failed)
        .collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "Failures:");
        for report in failures {
            let _ = writeln!(out, "  {}: {}", report.id, report.error.as_deref().unwrap_or("unknown error"));
        }
    }
    out
}

fn format_value(value: f64) -> String {
    if value != 0.0 && (value.abs() >= 1e6 || value.abs() < 1e-3) {
        format!("{:.3e}", value)
    } else {
        format!("{:.3}", value)
    }
}
