#![cfg(unix)]

use async_trait::async_trait;
use chipcore::{
    Builtin, ExecutionEvent, FlowGraph, Manifest, NodeContext, NodeError, NodeId, NodeStatus,
    ToolAdapter, Value,
};
use chipruntime::{AdapterRegistry, Candidate, FlowRuntime, Job, RunResult, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Runs `sh` with the script given in the node's options and records
/// `area <n>` log lines as `cellarea`.
struct Shell {
    tool: &'static str,
    task: &'static str,
}

#[async_trait]
impl ToolAdapter for Shell {
    fn tool(&self) -> &str {
        self.tool
    }

    fn task(&self) -> &str {
        self.task
    }

    async fn setup(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.tool_set_default("exe", "sh");
        Ok(())
    }

    async fn post_process(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let log = std::fs::read_to_string(ctx.log_path())?;
        for line in log.lines() {
            if let Some(Ok(area)) = line.strip_prefix("area ").map(|v| v.trim().parse::<f64>()) {
                ctx.record_metric("cellarea", area, vec![ctx.log_path()], None);
            }
        }
        Ok(())
    }
}

fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for task in ["import", "syn", "place", "route", "lint"] {
        registry.register(Arc::new(Shell { tool: "shell", task }));
    }
    registry.register(Arc::new(Shell { tool: "vtool", task: "import" }));
    registry
}

fn runtime(config: RuntimeConfig) -> FlowRuntime {
    FlowRuntime::with_registry(Arc::new(registry()), config)
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        max_parallel: 4,
        kill_grace: Duration::from_secs(1),
        ..RuntimeConfig::default()
    }
}

fn steps(names: &[&str]) -> RuntimeConfig {
    RuntimeConfig {
        steplist: names.iter().map(|s| s.to_string()).collect(),
        ..config()
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    path
}

/// Point `(step, index)` of `tool/task` at a script plus arguments.
fn use_script(manifest: &Manifest, tool: &str, task: &str, id: (&str, &str), script: &Path, args: &[&str]) {
    let mut options = vec![script.display().to_string()];
    options.extend(args.iter().map(|a| a.to_string()));
    manifest.set(&["tool", tool, "task", task, "option", id.0, id.1], options);
}

fn job(tmp: &TempDir) -> Job {
    Job::new(tmp.path().join("build").join("gcd").join("job0"), "gcd")
}

fn status(result: &RunResult, step: &str, index: &str) -> NodeStatus {
    result.status(step, index).unwrap()
}

/// import -> syn, with the design source as entry input
fn import_syn(tmp: &TempDir, manifest: &Manifest) -> (FlowGraph, Vec<PathBuf>, PathBuf) {
    let counter = tmp.path().join("import.count");
    let source = tmp.path().join("gcd.v");
    std::fs::write(&source, "module gcd();\nendmodule\n").unwrap();

    let import = script(
        tmp.path(),
        "import.sh",
        &format!("echo run >> {}\ncat inputs/gcd.v > outputs/gcd.vg", counter.display()),
    );
    let syn = script(tmp.path(), "syn.sh", "echo area 42.5\ncp inputs/gcd.vg outputs/gcd.netlist");
    use_script(manifest, "shell", "import", ("import", "0"), &import, &[]);
    use_script(manifest, "shell", "syn", ("syn", "0"), &syn, &[]);

    let mut g = FlowGraph::new("asic");
    g.node("import", "0", "shell", "import").unwrap().add_output("gcd.vg");
    g.node("syn", "0", "shell", "syn").unwrap().add_output("gcd.netlist");
    g.add_edge("syn", "0", "import", "0").unwrap();
    (g, vec![source], counter)
}

fn runs(counter: &Path) -> usize {
    std::fs::read_to_string(counter).map(|s| s.lines().count()).unwrap_or(0)
}

#[tokio::test]
async fn test_linear_flow_writes_job_layout() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let (graph, entry, _) = import_syn(&tmp, &manifest);
    let job = job(&tmp);
    let root = job.root.clone();

    let result = runtime(config()).run(&graph, job, manifest, entry).await.unwrap();

    assert!(result.success);
    assert!(!result.aborted);
    assert_eq!(status(&result, "syn", "0"), NodeStatus::Success);
    assert_eq!(result.metric("syn", "0", "cellarea"), Some(42.5));
    assert!(result.metric("syn", "0", "tasktime").is_some());

    let syn = root.join("syn").join("0");
    assert!(syn.join("inputs").join("gcd.vg").is_file());
    assert_eq!(
        std::fs::read_to_string(syn.join("outputs").join("gcd.netlist")).unwrap(),
        "module gcd();\nendmodule\n"
    );
    assert!(syn.join("syn.log").is_file());
    assert!(syn.join("status.json").is_file());
    assert!(syn.join("metrics.json").is_file());
    assert!(syn.join("outputs").join("gcd.pkg.json").is_file());
    assert!(root.join("run.json").is_file());

    let snapshot = Manifest::read_json(&syn.join("outputs").join("gcd.pkg.json")).unwrap();
    assert_eq!(snapshot.get_str(&["tool", "shell", "exe"]).as_deref(), Some("sh"));
}

#[tokio::test]
async fn test_failed_predecessor_skips_dependents_only() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let fail = script(tmp.path(), "fail.sh", "echo broken\nexit 1");
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    use_script(&manifest, "shell", "import", ("import", "0"), &fail, &[]);
    use_script(&manifest, "shell", "lint", ("lint", "0"), &ok, &[]);

    let mut g = FlowGraph::new("branches");
    g.node("import", "0", "shell", "import").unwrap();
    g.node("syn", "0", "shell", "syn").unwrap();
    g.node("lint", "0", "shell", "lint").unwrap();
    g.add_edge("syn", "0", "import", "0").unwrap();

    let job = job(&tmp);
    let root = job.root.clone();
    let result = runtime(config()).run(&g, job, manifest, vec![]).await.unwrap();

    assert_eq!(status(&result, "import", "0"), NodeStatus::Failed);
    assert_eq!(status(&result, "syn", "0"), NodeStatus::Skipped);
    // skipped before dispatch, so no directory was ever prepared for it
    assert!(!root.join("syn").exists());
    assert_eq!(status(&result, "lint", "0"), NodeStatus::Success);
    assert!(!result.success);
    assert!(!result.aborted);

    let import = result.report(&NodeId::new("import", "0")).unwrap();
    assert!(import.error.as_deref().unwrap().contains("exit code Some(1)"));
    let syn = result.report(&NodeId::new("syn", "0")).unwrap();
    assert!(syn.error.as_deref().unwrap().contains("import/0"));
}

#[tokio::test]
async fn test_version_mismatch_aborts_with_fail_fast() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let version = script(tmp.path(), "version.sh", "echo 0.9.0");
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    manifest.set(&["tool", "vtool", "version"], ">=1.0.0");
    manifest.set(&["tool", "vtool", "vswitch"], vec![version.display().to_string()]);
    use_script(&manifest, "vtool", "import", ("import", "0"), &ok, &[]);
    use_script(&manifest, "shell", "syn", ("syn", "0"), &ok, &[]);
    use_script(&manifest, "shell", "lint", ("lint", "0"), &ok, &[]);

    let mut g = FlowGraph::new("vercheck");
    g.node("import", "0", "vtool", "import").unwrap();
    g.node("syn", "0", "shell", "syn").unwrap();
    g.node("lint", "0", "shell", "lint").unwrap();
    g.add_edge("syn", "0", "import", "0").unwrap();
    g.add_edge("lint", "0", "syn", "0").unwrap();

    let config = RuntimeConfig {
        fail_fast: true,
        ..config()
    };
    let job = job(&tmp);
    let root = job.root.clone();
    let result = runtime(config).run(&g, job, manifest, vec![]).await.unwrap();

    assert!(!result.success);
    assert!(result.aborted);
    assert_eq!(status(&result, "import", "0"), NodeStatus::Failed);
    assert_eq!(status(&result, "syn", "0"), NodeStatus::Skipped);
    assert_eq!(status(&result, "lint", "0"), NodeStatus::Skipped);

    let error = result.report(&NodeId::new("import", "0")).unwrap().error.clone().unwrap();
    assert!(error.contains("found 0.9.0"), "{}", error);
    assert!(error.contains(">=1.0.0"), "{}", error);
    // the tool itself never ran
    assert!(!root.join("import").join("0").join("import.log").exists());
}

#[tokio::test]
async fn test_version_query_failure_keeps_tool_output() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let version = script(tmp.path(), "version.sh", "echo VERSION FAILED\nexit 3");
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    manifest.set(&["tool", "vtool", "version"], ">=1.0.0");
    manifest.set(&["tool", "vtool", "vswitch"], vec![version.display().to_string()]);
    use_script(&manifest, "vtool", "import", ("import", "0"), &ok, &[]);

    let mut g = FlowGraph::new("vercheck");
    g.node("import", "0", "vtool", "import").unwrap();

    let result = runtime(config()).run(&g, job(&tmp), manifest, vec![]).await.unwrap();
    let error = result.report(&NodeId::new("import", "0")).unwrap().error.clone().unwrap();
    assert!(error.contains("version query failed"), "{}", error);
    assert!(error.contains("VERSION FAILED"), "{}", error);
}

#[tokio::test]
async fn test_novercheck_skips_version_query() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let version = script(tmp.path(), "version.sh", "echo 0.1");
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    manifest.set(&["tool", "vtool", "version"], ">=1.0.0");
    manifest.set(&["tool", "vtool", "vswitch"], vec![version.display().to_string()]);
    manifest.set(&["option", "novercheck"], true);
    use_script(&manifest, "vtool", "import", ("import", "0"), &ok, &[]);

    let mut g = FlowGraph::new("vercheck");
    g.node("import", "0", "vtool", "import").unwrap();

    let result = runtime(config()).run(&g, job(&tmp), manifest, vec![]).await.unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_resume_reuses_intact_nodes() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let (graph, entry, counter) = import_syn(&tmp, &manifest);

    let first = runtime(config())
        .run(&graph, job(&tmp), manifest.clone(), entry.clone())
        .await
        .unwrap();
    assert!(first.success);
    assert_eq!(runs(&counter), 1);

    let resume = RuntimeConfig {
        resume: true,
        ..config()
    };
    let second = runtime(resume.clone())
        .run(&graph, job(&tmp), manifest.clone(), entry.clone())
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!(runs(&counter), 1);
    assert!(second.report(&NodeId::new("import", "0")).unwrap().resumed);
    assert!(second.report(&NodeId::new("syn", "0")).unwrap().resumed);
    assert_eq!(second.metric("syn", "0", "cellarea"), Some(42.5));

    // a node whose outputs disappeared runs again, and so does everything after it
    let job = job(&tmp);
    std::fs::remove_file(job.outputs_dir(&NodeId::new("import", "0")).join("gcd.vg")).unwrap();
    let third = runtime(resume).run(&graph, job, manifest, entry).await.unwrap();
    assert!(third.success);
    assert_eq!(runs(&counter), 2);
    assert!(!third.report(&NodeId::new("syn", "0")).unwrap().resumed);
}

#[tokio::test]
async fn test_minimum_forwards_best_successful_candidate() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let place = script(tmp.path(), "place.sh", "echo area $1\necho $1 > outputs/place.def");
    let fail = script(tmp.path(), "fail.sh", "echo area 1\nexit 1");
    let route = script(tmp.path(), "route.sh", "cp inputs/place.def outputs/route.def");
    use_script(&manifest, "shell", "place", ("place", "0"), &place, &["5"]);
    use_script(&manifest, "shell", "place", ("place", "1"), &place, &["2"]);
    use_script(&manifest, "shell", "place", ("place", "2"), &fail, &[]);
    use_script(&manifest, "shell", "route", ("route", "0"), &route, &[]);

    let mut g = FlowGraph::new("explore");
    for index in ["0", "1", "2"] {
        g.node("place", index, "shell", "place").unwrap().add_output("place.def");
    }
    g.add_builtin("placemin", "0", Builtin::Minimum)
        .unwrap()
        .set_select("cellarea");
    for index in ["0", "1", "2"] {
        g.add_edge("placemin", "0", "place", index).unwrap();
    }
    g.node("route", "0", "shell", "route").unwrap().add_output("route.def");
    g.add_edge("route", "0", "placemin", "0").unwrap();

    let job = job(&tmp);
    let root = job.root.clone();
    let result = runtime(config()).run(&g, job, manifest.clone(), vec![]).await.unwrap();

    assert_eq!(status(&result, "place", "2"), NodeStatus::Failed);
    assert_eq!(status(&result, "placemin", "0"), NodeStatus::Success);
    assert_eq!(status(&result, "route", "0"), NodeStatus::Success);
    assert!(result.success);
    assert_eq!(
        manifest.get_strings(&["record", "select", "placemin", "0"]),
        vec!["place/1".to_string()]
    );
    let routed = std::fs::read_to_string(root.join("route").join("0").join("outputs").join("route.def")).unwrap();
    assert_eq!(routed.trim(), "2");
}

#[tokio::test]
async fn test_timeout_kills_tool() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let slow = script(tmp.path(), "slow.sh", "exec sleep 30");
    use_script(&manifest, "shell", "place", ("place", "0"), &slow, &[]);
    manifest.set(&["tool", "shell", "task", "place", "timeout", "place", "0"], 0.5);

    let mut g = FlowGraph::new("slow");
    g.node("place", "0", "shell", "place").unwrap();

    let result = runtime(config()).run(&g, job(&tmp), manifest, vec![]).await.unwrap();
    let report = result.report(&NodeId::new("place", "0")).unwrap();
    assert_eq!(report.status, NodeStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("Timeout"));
    assert!(report.duration_ms < 10_000);
}

#[tokio::test]
async fn test_missing_output_fails_node() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let lazy = script(tmp.path(), "lazy.sh", "echo nothing written");
    use_script(&manifest, "shell", "syn", ("syn", "0"), &lazy, &[]);
    manifest.set(&["tool", "shell", "task", "syn", "output", "syn", "0"], vec!["gcd.vg"]);

    let mut g = FlowGraph::new("lazy");
    g.node("syn", "0", "shell", "syn").unwrap();

    let result = runtime(config()).run(&g, job(&tmp), manifest, vec![]).await.unwrap();
    let report = result.report(&NodeId::new("syn", "0")).unwrap();
    assert_eq!(report.status, NodeStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("gcd.vg"));
}

#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let (graph, entry, counter) = import_syn(&tmp, &manifest);

    let runtime = runtime(config());
    runtime.cancellation_token().cancel();
    let result = runtime.run(&graph, job(&tmp), manifest, entry).await.unwrap();

    assert!(result.aborted);
    assert!(!result.success);
    assert_eq!(result.count(NodeStatus::Skipped), 2);
    assert_eq!(runs(&counter), 0);
}

#[tokio::test]
async fn test_structural_errors_stop_before_execution() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());

    let mut g = FlowGraph::new("unknown");
    g.node("import", "0", "nosuchtool", "import").unwrap();
    let err = runtime(config())
        .run(&g, job(&tmp), manifest.clone(), vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nosuchtool/import"));

    let empty = FlowGraph::new("empty");
    assert!(runtime(config()).run(&empty, job(&tmp), manifest, vec![]).await.is_err());
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let (graph, entry, _) = import_syn(&tmp, &manifest);

    let runtime = runtime(config());
    let mut events = runtime.subscribe_events();
    runtime.run(&graph, job(&tmp), manifest, entry).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(matches!(received.first(), Some(ExecutionEvent::RunStarted { nodes: 2, .. })));
    assert!(matches!(received.last(), Some(ExecutionEvent::RunCompleted { success: true, .. })));
    let started = received
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeStarted { .. }))
        .count();
    assert_eq!(started, 2);
}

#[tokio::test]
async fn test_numeric_manifest_values_reach_the_tool() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let echo = script(tmp.path(), "echo.sh", "echo \"ARGS:$*\"");
    let version = script(tmp.path(), "version.sh", "echo 0.1");
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    manifest.set(
        &["tool", "shell", "task", "syn", "option", "syn", "0"],
        Value::parse_literal(&format!("{},-j,4", echo.display())),
    );
    manifest.set(&["tool", "vtool", "version"], Value::parse_literal("2.1"));
    manifest.set(&["tool", "vtool", "vswitch"], vec![version.display().to_string()]);
    use_script(&manifest, "vtool", "import", ("import", "0"), &ok, &[]);

    let mut g = FlowGraph::new("numbers");
    g.node("syn", "0", "shell", "syn").unwrap();
    g.node("import", "0", "vtool", "import").unwrap();

    let job = job(&tmp);
    let root = job.root.clone();
    let result = runtime(config()).run(&g, job, manifest, vec![]).await.unwrap();

    assert_eq!(status(&result, "syn", "0"), NodeStatus::Success);
    let log = std::fs::read_to_string(root.join("syn").join("0").join("syn.log")).unwrap();
    assert_eq!(log.trim(), "ARGS:-j 4");

    assert_eq!(status(&result, "import", "0"), NodeStatus::Failed);
    let error = result.report(&NodeId::new("import", "0")).unwrap().error.clone().unwrap();
    assert!(error.contains("found 0.1"), "{}", error);
}

#[tokio::test]
async fn test_version_query_that_cannot_start_fails_the_query() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    let missing = tmp.path().join("no-such-tool");
    manifest.set(&["tool", "vtool", "exe"], missing.display().to_string());
    manifest.set(&["tool", "vtool", "version"], ">=1.0.0");
    use_script(&manifest, "vtool", "import", ("import", "0"), &ok, &[]);

    let mut g = FlowGraph::new("vercheck");
    g.node("import", "0", "vtool", "import").unwrap();

    let result = runtime(config()).run(&g, job(&tmp), manifest, vec![]).await.unwrap();
    let error = result.report(&NodeId::new("import", "0")).unwrap().error.clone().unwrap();
    assert!(error.contains("version query failed"), "{}", error);
    assert!(error.contains("no-such-tool"), "{}", error);
}

#[tokio::test]
async fn test_timeout_lets_tool_exit_cleanly() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let marker = tmp.path().join("stopped");
    let trap = script(
        tmp.path(),
        "trap.sh",
        &format!("trap 'echo clean > {}; exit 0' TERM\nsleep 30 &\nwait $!", marker.display()),
    );
    use_script(&manifest, "shell", "place", ("place", "0"), &trap, &[]);
    manifest.set(&["tool", "shell", "task", "place", "timeout", "place", "0"], 0.5);

    let mut g = FlowGraph::new("slow");
    g.node("place", "0", "shell", "place").unwrap();

    let result = runtime(config()).run(&g, job(&tmp), manifest, vec![]).await.unwrap();
    let report = result.report(&NodeId::new("place", "0")).unwrap();
    assert_eq!(report.status, NodeStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("Timeout"));
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "clean");
    assert!(report.duration_ms < 10_000);
}

#[tokio::test]
async fn test_steplist_runs_selected_steps() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let (graph, entry, counter) = import_syn(&tmp, &manifest);
    let import = NodeId::new("import", "0");
    let syn = NodeId::new("syn", "0");

    let first = runtime(steps(&["import"]))
        .run(&graph, job(&tmp), manifest.clone(), entry.clone())
        .await
        .unwrap();
    assert!(first.success);
    assert_eq!(runs(&counter), 1);
    assert!(first.report(&syn).is_none());
    assert_eq!(first.steplist, vec!["import"]);

    // syn alone takes import over from the job directory
    let second = runtime(steps(&["syn"]))
        .run(&graph, job(&tmp), manifest.clone(), entry.clone())
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!(runs(&counter), 1);
    assert!(second.report(&import).unwrap().resumed);
    assert_eq!(status(&second, "syn", "0"), NodeStatus::Success);
    assert!(!second.report(&syn).unwrap().resumed);

    // a fresh job has no import result, so import runs as well
    let fresh = Job::new(tmp.path().join("build").join("gcd").join("job1"), "gcd");
    let third = runtime(steps(&["syn"]))
        .run(&graph, fresh, manifest.clone(), entry.clone())
        .await
        .unwrap();
    assert!(third.success);
    assert_eq!(runs(&counter), 2);
    assert!(!third.report(&import).unwrap().resumed);

    let err = runtime(steps(&["route"]))
        .run(&graph, job(&tmp), manifest, entry)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("route"));
}

#[tokio::test]
async fn test_join_gathers_every_branch() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let a = script(tmp.path(), "a.sh", "echo module a > outputs/a.v");
    let b = script(tmp.path(), "b.sh", "echo module b > outputs/b.v");
    let syn = script(tmp.path(), "syn.sh", "cat inputs/a.v inputs/b.v > outputs/all.v");
    use_script(&manifest, "shell", "import", ("import", "0"), &a, &[]);
    use_script(&manifest, "shell", "import", ("import", "1"), &b, &[]);
    use_script(&manifest, "shell", "syn", ("syn", "0"), &syn, &[]);

    let mut g = FlowGraph::new("joined");
    g.node("import", "0", "shell", "import").unwrap().add_output("a.v");
    g.node("import", "1", "shell", "import").unwrap().add_output("b.v");
    g.add_builtin("merge", "0", Builtin::Join).unwrap();
    g.add_edge("merge", "0", "import", "0").unwrap();
    g.add_edge("merge", "0", "import", "1").unwrap();
    g.node("syn", "0", "shell", "syn").unwrap().add_output("all.v");
    g.add_edge("syn", "0", "merge", "0").unwrap();

    let job = job(&tmp);
    let root = job.root.clone();
    let result = runtime(config()).run(&g, job, manifest, vec![]).await.unwrap();

    assert!(result.success);
    let merge = result.report(&NodeId::new("merge", "0")).unwrap();
    assert_eq!(merge.outputs, vec!["a.v", "b.v"]);
    let all = std::fs::read_to_string(root.join("syn").join("0").join("outputs").join("all.v")).unwrap();
    assert_eq!(all, "module a\nmodule b\n");
}

#[tokio::test]
async fn test_mux_forwards_the_selected_candidate() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let place = script(tmp.path(), "place.sh", "echo area $1\necho $1 > outputs/place.def");
    let route = script(tmp.path(), "route.sh", "cp inputs/place.def outputs/route.def");
    use_script(&manifest, "shell", "place", ("place", "0"), &place, &["5"]);
    use_script(&manifest, "shell", "place", ("place", "1"), &place, &["2"]);
    use_script(&manifest, "shell", "route", ("route", "0"), &route, &[]);

    let mut registry = registry();
    registry.register_selector(
        "small_area",
        Arc::new(|c: &[Candidate]| {
            c.iter()
                .filter(|c| c.metric("cellarea").map_or(false, |a| a < 3.0))
                .map(|c| c.id.clone())
                .collect::<Vec<_>>()
        }),
    );

    let mut g = FlowGraph::new("explore");
    for index in ["0", "1"] {
        g.node("place", index, "shell", "place").unwrap().add_output("place.def");
    }
    g.add_builtin("placemux", "0", Builtin::Mux)
        .unwrap()
        .set_select("small_area");
    for index in ["0", "1"] {
        g.add_edge("placemux", "0", "place", index).unwrap();
    }
    g.node("route", "0", "shell", "route").unwrap().add_output("route.def");
    g.add_edge("route", "0", "placemux", "0").unwrap();

    let job = job(&tmp);
    let root = job.root.clone();
    let result = FlowRuntime::with_registry(Arc::new(registry), config())
        .run(&g, job, manifest.clone(), vec![])
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        manifest.get_strings(&["record", "select", "placemux", "0"]),
        vec!["place/1".to_string()]
    );
    let routed = std::fs::read_to_string(root.join("route").join("0").join("outputs").join("route.def")).unwrap();
    assert_eq!(routed.trim(), "2");
}

#[tokio::test]
async fn test_fail_fast_lets_running_nodes_finish() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let done = tmp.path().join("b.done");
    let fail = script(tmp.path(), "fail.sh", "exit 1");
    let slow = script(tmp.path(), "slow.sh", &format!("sleep 1\necho done > {}", done.display()));
    let ok = script(tmp.path(), "ok.sh", "echo fine");
    use_script(&manifest, "shell", "lint", ("a", "0"), &fail, &[]);
    use_script(&manifest, "shell", "lint", ("b", "0"), &slow, &[]);
    use_script(&manifest, "shell", "lint", ("c", "0"), &ok, &[]);

    let mut g = FlowGraph::new("lints");
    for step in ["a", "b", "c"] {
        g.node(step, "0", "shell", "lint").unwrap();
    }

    let config = RuntimeConfig {
        max_parallel: 2,
        fail_fast: true,
        ..config()
    };
    let result = runtime(config).run(&g, job(&tmp), manifest, vec![]).await.unwrap();

    assert!(result.aborted);
    assert_eq!(status(&result, "a", "0"), NodeStatus::Failed);
    assert_eq!(status(&result, "b", "0"), NodeStatus::Success);
    assert!(done.is_file());
    assert_eq!(status(&result, "c", "0"), NodeStatus::Skipped);
    let c = result.report(&NodeId::new("c", "0")).unwrap();
    assert!(c.error.as_deref().unwrap().contains("a/0"));
}

#[tokio::test]
async fn test_max_parallel_bounds_running_nodes() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let slots = tmp.path().join("slots");
    std::fs::create_dir(&slots).unwrap();
    let lint = script(
        tmp.path(),
        "lint.sh",
        &format!(
            "touch {d}/$1\nls {d} | wc -l > outputs/seen\nsleep 1\nrm {d}/$1",
            d = slots.display()
        ),
    );

    let mut g = FlowGraph::new("lints");
    for index in ["0", "1", "2", "3"] {
        use_script(&manifest, "shell", "lint", ("lint", index), &lint, &[index]);
        g.node("lint", index, "shell", "lint").unwrap().add_output("seen");
    }

    let config = RuntimeConfig {
        max_parallel: 2,
        ..config()
    };
    let job = job(&tmp);
    let root = job.root.clone();
    let result = runtime(config).run(&g, job, manifest, vec![]).await.unwrap();
    assert!(result.success);

    let most = ["0", "1", "2", "3"]
        .iter()
        .map(|index| {
            let seen = root.join("lint").join(index).join("outputs").join("seen");
            std::fs::read_to_string(seen).unwrap().trim().parse::<usize>().unwrap()
        })
        .max()
        .unwrap();
    assert_eq!(most, 2);
}

#[tokio::test]
async fn test_status_is_running_while_the_tool_runs() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(Manifest::new());
    let peek = script(tmp.path(), "peek.sh", "cp status.json outputs/status.seen\nsleep 1");
    use_script(&manifest, "shell", "syn", ("syn", "0"), &peek, &[]);

    let mut g = FlowGraph::new("peek");
    g.node("syn", "0", "shell", "syn").unwrap().add_output("status.seen");
    let id = NodeId::new("syn", "0");

    let runtime = Arc::new(runtime(config()));
    let board = runtime.status_board();
    let mut events = runtime.subscribe_events();
    let job = job(&tmp);
    let root = job.root.clone();
    let handle = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run(&g, job, manifest, vec![]).await })
    };

    while let Ok(event) = events.recv().await {
        if matches!(event, ExecutionEvent::NodeStarted { .. }) {
            break;
        }
    }
    assert_eq!(board.get(&id), Some(NodeStatus::Running));

    let result = handle.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(board.get(&id), Some(NodeStatus::Success));
    let seen = std::fs::read_to_string(root.join("syn").join("0").join("outputs").join("status.seen")).unwrap();
    assert!(seen.contains("\"running\""), "{}", seen);
}
