//! OpenSTA static timing analysis (`opensta/timing`).
//!
//! The timing script prints `SC_METRIC: <name>` headers; the value follows
//! on a later line whose shape depends on the metric. Anything between a
//! header and its value line is noise from the tool.

use crate::report::{count_matches, leading_number, provenance, read_lossy};
use async_trait::async_trait;
use chipcore::{AdapterInfo, NodeContext, NodeError, ToolAdapter};
use once_cell::sync::Lazy;
use regex::Regex;

static METRIC_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^SC_METRIC:\s+(\w+)").unwrap());
static FMAX: Lazy<Regex> = Lazy::new(|| Regex::new(r"fmax = (\d*\.?\d*)").unwrap());
static TNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^tns (.*)").unwrap());
static SLACK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^worst slack (.*)").unwrap());
static POWER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Total(.*)").unwrap());
static VIOLATED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(VIOLATED\)$").unwrap());
static VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)+").unwrap());

const COUNT_METRICS: &[&str] = &[
    "logicdepth",
    "cells",
    "nets",
    "buffers",
    "registers",
    "unconstrained",
    "pins",
    "setuppaths",
    "holdpaths",
];

const DRV_REPORT: &str = "reports/drv_violators.rpt";

/// A value extracted from the timing log
#[derive(Debug, Clone, PartialEq)]
pub struct TimingMetric {
    pub metric: String,
    pub value: f64,
    pub unit: Option<String>,
}

impl TimingMetric {
    fn new(metric: &str, value: f64, unit: Option<&str>) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            unit: unit.map(String::from),
        }
    }
}

/// Extract metrics from an OpenSTA log. Power values are reported once, as
/// the maximum over every corner.
pub fn parse_timing_log(text: &str) -> Vec<TimingMetric> {
    let mut metrics = Vec::new();
    let mut timescale = "s".to_string();
    let mut awaiting: Option<String> = None;
    let mut peakpower: Vec<f64> = Vec::new();
    let mut leakagepower: Vec<f64> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = METRIC_HEADER.captures(line) {
            awaiting = Some(caps[1].to_string());
            continue;
        }
        let Some(metric) = awaiting.as_deref() else {
            continue;
        };

        let done = match metric {
            "timeunit" => {
                timescale = format!("{}s", line.trim());
                true
            }
            "fmax" => match FMAX.captures(line).and_then(|c| c[1].parse().ok()) {
                Some(v) => {
                    metrics.push(TimingMetric::new("fmax", v, Some("MHz")));
                    true
                }
                None => false,
            },
            "power" => match POWER.captures(line).and_then(|c| corner_power(&c[1])) {
                Some((leakage, total)) => {
                    leakagepower.push(leakage);
                    peakpower.push(total);
                    true
                }
                None => false,
            },
            "cellarea" => match leading_number(line) {
                Some(v) => {
                    metrics.push(TimingMetric::new("cellarea", v, Some("um^2")));
                    true
                }
                None => false,
            },
            m if COUNT_METRICS.contains(&m) => match leading_number(line) {
                Some(v) => {
                    metrics.push(TimingMetric::new(m, v.trunc(), None));
                    true
                }
                None => false,
            },
            "setupslack" | "holdslack" => match SLACK.captures(line).and_then(|c| c[1].trim().parse().ok()) {
                Some(v) => {
                    metrics.push(TimingMetric::new(metric, v, Some(timescale.as_str())));
                    true
                }
                None => false,
            },
            "setuptns" | "holdtns" => match TNS.captures(line).and_then(|c| c[1].trim().parse().ok()) {
                Some(v) => {
                    metrics.push(TimingMetric::new(metric, v, Some(timescale.as_str())));
                    true
                }
                None => false,
            },
            // skew is not taken from the log
            "setupskew" | "holdskew" => false,
            _ => true,
        };
        if done {
            awaiting = None;
        }
    }

    if let Some(max) = max_of(&peakpower) {
        metrics.push(TimingMetric::new("peakpower", max, Some("W")));
    }
    if let Some(max) = max_of(&leakagepower) {
        metrics.push(TimingMetric::new("leakagepower", max, Some("W")));
    }
    metrics
}

/// `Total <internal> <switching> <leakage> <total> <percent>`
fn corner_power(fields: &str) -> Option<(f64, f64)> {
    let fields: Vec<&str> = fields.split_whitespace().collect();
    let leakage = fields.get(2)?.parse().ok()?;
    let total = fields.get(3)?.parse().ok()?;
    Some((leakage, total))
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

/// Report files that back a metric, relative to the node directory
fn report_map(ctx: &NodeContext, metric: &str) -> Vec<String> {
    let setup = ["reports/setup.rpt", "reports/setup.topN.rpt"];
    let hold = ["reports/hold.rpt", "reports/hold.topN.rpt"];
    let reports: Vec<&str> = match metric {
        "power" | "peakpower" | "leakagepower" => {
            return ctx
                .manifest
                .getkeys(&["constraint", "timing"])
                .iter()
                .map(|corner| format!("reports/power.{}.rpt", corner))
                .collect();
        }
        "unconstrained" => vec!["reports/unconstrained.rpt", "reports/unconstrained.topN.rpt"],
        "setuppaths" | "setupslack" | "setuptns" => setup.to_vec(),
        "holdpaths" | "holdslack" | "holdtns" => hold.to_vec(),
        "setupskew" => ["reports/skew.setup.rpt"].into_iter().chain(setup).collect(),
        "holdskew" => ["reports/skew.hold.rpt"].into_iter().chain(hold).collect(),
        _ => Vec::new(),
    };
    reports.into_iter().map(String::from).collect()
}

pub struct OpenStaTiming;

#[async_trait]
impl ToolAdapter for OpenStaTiming {
    fn tool(&self) -> &str {
        "opensta"
    }

    fn task(&self) -> &str {
        "timing"
    }

    async fn setup(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.tool_set_default("exe", "sta");
        ctx.tool_set_default("vswitch", vec!["-version"]);
        ctx.tool_set_default("version", ">=2.0.0");

        ctx.task_set_default("option", vec!["-no_init", "-no_splash", "-exit"]);
        ctx.task_set_default("script", "sc_timing.tcl");
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        ctx.task_set("threads", threads);
        ctx.manifest.set_default(
            &["tool", &ctx.tool, "task", &ctx.task, "var", "top_n_paths", ctx.step(), ctx.index()],
            "10",
        );
        Ok(())
    }

    async fn runtime_options(&self, ctx: &NodeContext) -> Result<Vec<String>, NodeError> {
        let mut options = Vec::new();
        if let Some(threads) = ctx.task_get("threads").and_then(|v| v.as_f64()) {
            options.push("-threads".to_string());
            options.push((threads as u64).to_string());
        }
        if let Some(script) = ctx.task_get("script").and_then(|v| v.as_str().map(String::from)) {
            options.push(script);
        }
        Ok(options)
    }

    async fn post_process(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let log = ctx.log_path();
        let text = read_lossy(&log)?;

        for m in parse_timing_log(&text) {
            let sources = provenance(ctx, &report_map(ctx, &m.metric));
            ctx.record_metric(&m.metric, m.value, sources, m.unit.as_deref());
        }

        let drv_report = ctx.path(DRV_REPORT);
        if drv_report.is_file() {
            let drvs = count_matches(&drv_report, &VIOLATED)?;
            ctx.record_metric("drvs", drvs as f64, vec![drv_report, log], None);
        }
        Ok(())
    }

    fn parse_version(&self, raw: &str) -> Option<String> {
        VERSION.find(raw).map(|m| m.as_str().to_string())
    }

    fn describe(&self) -> AdapterInfo {
        AdapterInfo {
            description: "Static timing analysis with OpenSTA".to_string(),
            category: "timing".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_then_value_after_noise() {
        let log = "\
SC_METRIC: cellarea
Warning: library has no area for cell FILL1
Info: reading liberty
1234.5
";
        let metrics = parse_timing_log(log);
        assert_eq!(metrics, vec![TimingMetric::new("cellarea", 1234.5, Some("um^2"))]);
    }

    #[test]
    fn slack_uses_reported_timeunit() {
        let log = "\
SC_METRIC: timeunit
n
SC_METRIC: setupslack
worst slack 0.42
SC_METRIC: holdtns
tns -1.5
";
        let metrics = parse_timing_log(log);
        assert_eq!(
            metrics,
            vec![
                TimingMetric::new("setupslack", 0.42, Some("ns")),
                TimingMetric::new("holdtns", -1.5, Some("ns")),
            ]
        );
    }

    #[test]
    fn power_takes_worst_corner() {
        let log = "\
SC_METRIC: power
Group Internal Switching Leakage Total
Total 1.0e-03 2.0e-03 1.0e-06 3.0e-03 100.0%
SC_METRIC: power
Total 2.0e-03 2.0e-03 4.0e-06 5.0e-03 100.0%
";
        let metrics = parse_timing_log(log);
        assert_eq!(
            metrics,
            vec![
                TimingMetric::new("peakpower", 5.0e-03, Some("W")),
                TimingMetric::new("leakagepower", 4.0e-06, Some("W")),
            ]
        );
    }

    #[test]
    fn counts_fmax_and_unknown_headers() {
        let log = "\
SC_METRIC: mystery
SC_METRIC: cells
 420
SC_METRIC: fmax
fmax = 512.5
SC_METRIC: setupskew
-0.1 setup skew
SC_METRIC: nets
88
";
        let metrics = parse_timing_log(log);
        assert_eq!(
            metrics,
            vec![
                TimingMetric::new("cells", 420.0, None),
                TimingMetric::new("fmax", 512.5, Some("MHz")),
                TimingMetric::new("nets", 88.0, None),
            ]
        );
    }

    #[test]
    fn version_token() {
        let adapter = OpenStaTiming;
        assert_eq!(adapter.parse_version("2.4.0 1a2b3c\n").as_deref(), Some("2.4.0"));
        assert_eq!(adapter.parse_version("no version"), None);
    }
}
