use anyhow::{bail, Context, Result};
use chipcore::{Builtin, ExecutionEvent, FlowGraph, Manifest, NodeEvent, Value};
use chipruntime::{summary, AdapterRegistry, FlowRuntime, Job, RunResult, RuntimeConfig, RUN_FILE};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chipflow")]
#[command(about = "Chip design flow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file
    Run(RunArgs),

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available tool adapters
    Tools,

    /// Create an example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },

    /// Print the summary of a finished run
    Summary {
        /// Job directory holding run.json
        jobdir: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to flow JSON file
    #[arg(short, long)]
    flow: PathBuf,

    /// Job directory [default: build/<design>/job0]
    #[arg(long)]
    jobdir: Option<PathBuf>,

    /// Design name [default: stem of the first input, else the flow name]
    #[arg(short, long)]
    design: Option<String>,

    /// Files handed to the entry nodes
    #[arg(short, long)]
    input: Vec<PathBuf>,

    /// Manifest JSON to start from
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Maximum number of nodes running at once
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Stop starting nodes after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Reuse nodes that already succeeded in the job directory
    #[arg(long)]
    resume: bool,

    /// Only run these steps (repeatable); missing predecessors run too
    #[arg(long = "step", value_name = "STEP")]
    steps: Vec<String>,

    /// Set a manifest value, e.g. tool.opensta.exe=/usr/bin/sta
    #[arg(long = "set", value_name = "KEY.PATH=VALUE")]
    set: Vec<String>,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_logging(args.verbose, args.quiet);
            let result = run_flow(args).await?;
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Validate { file } => {
            init_logging(false, true);
            validate_flow(&file)?;
        }

        Commands::Tools => {
            init_logging(false, true);
            list_tools();
        }

        Commands::Init { output } => {
            init_logging(false, true);
            create_example_flow(&output)?;
        }

        Commands::Summary { jobdir } => {
            init_logging(false, true);
            let path = jobdir.join(RUN_FILE);
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            let result: RunResult = serde_json::from_str(&json)?;
            print!("{}", summary::render(&result));
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// `RUST_LOG` wins over the verbosity flags.
fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    chiptools::register_all(&mut registry);
    registry
}

fn load_flow(file: &Path) -> Result<FlowGraph> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("unable to read flow {}", file.display()))?;
    let graph: FlowGraph = serde_json::from_str(&json)
        .with_context(|| format!("invalid flow {}", file.display()))?;
    Ok(graph)
}

/// Apply `a.b.c=value` to the manifest.
fn apply_set(manifest: &Manifest, assignment: &str) -> Result<()> {
    let Some((key, value)) = assignment.split_once('=') else {
        bail!("expected KEY.PATH=VALUE, got '{}'", assignment);
    };
    let keypath: Vec<&str> = key.split('.').map(str::trim).filter(|k| !k.is_empty()).collect();
    if keypath.is_empty() {
        bail!("empty key in '{}'", assignment);
    }
    manifest.set(&keypath, Value::parse_literal(value.trim()));
    Ok(())
}

/// Explicit name, else the file stem of the first input, else the flow name.
fn design_name(explicit: Option<&str>, inputs: &[PathBuf], flow: &str) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    inputs
        .first()
        .and_then(|path| path.file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| flow.to_string())
}

async fn run_flow(args: RunArgs) -> Result<RunResult> {
    let graph = load_flow(&args.flow)?;
    let design = design_name(args.design.as_deref(), &args.input, &graph.name);
    let jobdir = args
        .jobdir
        .clone()
        .unwrap_or_else(|| PathBuf::from("build").join(&design).join("job0"));

    let manifest = match &args.manifest {
        Some(path) => Manifest::read_json(path)
            .with_context(|| format!("unable to load manifest {}", path.display()))?,
        None => Manifest::new(),
    };
    for assignment in &args.set {
        apply_set(&manifest, assignment)?;
    }
    manifest.set(&["option", "design"], design.as_str());
    tracing::debug!("Manifest has {} entries", manifest.len());

    let mut config = RuntimeConfig::from_manifest(&manifest);
    if let Some(jobs) = args.jobs {
        config.max_parallel = jobs.max(1);
    }
    config.fail_fast |= args.fail_fast;
    config.resume |= args.resume;
    if !args.steps.is_empty() {
        config.steplist = args.steps.clone();
    }

    if !args.quiet {
        println!("🚀 Flow '{}' ({} nodes) for design '{}'", graph.name, graph.len(), design);
        println!("   Job directory: {}", jobdir.display());
        println!();
    }

    let runtime = FlowRuntime::with_registry(Arc::new(registry()), config);

    let cancel = runtime.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, waiting for running nodes to finish");
            cancel.cancel();
        }
    });

    let mut events = runtime.subscribe_events();
    let quiet = args.quiet;
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if !quiet {
                print_event(event);
            }
        }
    });

    let result = runtime
        .run(&graph, Job::new(&jobdir, &design), Arc::new(manifest), args.input.clone())
        .await?;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    if !args.quiet {
        println!();
        print!("{}", summary::render(&result));
    }
    Ok(result)
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { .. } => {
            println!("▶️  Run started");
        }
        ExecutionEvent::NodeStarted { node, tool, task, .. } => {
            println!("  ⚡ Starting {} ({}/{})", node, tool, task);
        }
        ExecutionEvent::NodeCompleted { node, duration_ms, .. } => {
            println!("  ✅ {} completed in {}ms", node, duration_ms);
        }
        ExecutionEvent::NodeFailed { node, error, .. } => {
            println!("  ❌ {} failed: {}", node, error);
        }
        ExecutionEvent::NodeSkipped { node, reason, .. } => {
            println!("  ⏭️  {} skipped: {}", node, reason);
        }
        ExecutionEvent::NodeEvent { node, event, .. } => match event {
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node, message),
        },
        ExecutionEvent::RunCompleted { success, duration_ms, .. } => {
            if success {
                println!("✨ Run completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Run failed after {}ms", duration_ms);
            }
        }
    }
}

fn validate_flow(file: &Path) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let graph = load_flow(file)?;
    graph.validate()?;
    registry().check_graph(&graph)?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", graph.name);
    println!("   Nodes: {}", graph.len());
    for (n, layer) in graph.topological_layers().enumerate() {
        let names: Vec<String> = layer.iter().map(|id| id.to_string()).collect();
        println!("   Layer {}: {}", n, names.join(", "));
    }
    Ok(())
}

fn list_tools() {
    println!("📦 Available tools:");
    println!();

    let registry = registry();
    for (tool, task) in registry.list_adapters() {
        match registry.get_info(&tool, &task) {
            Some(info) => {
                println!("  • {}/{} ({})", tool, task, info.category);
                println!("    {}", info.description);
            }
            None => println!("  • {}/{}", tool, task),
        }
    }
    println!();
    println!("Builtins: join, minimum, maximum, mux, nop");
}

fn example_flow() -> Result<FlowGraph> {
    let mut graph = FlowGraph::new("asicflow");
    graph.node("import", "0", "command", "run")?.add_output("gcd.v");
    graph.node("syn", "0", "command", "run")?.add_output("gcd.vg");
    graph.add_edge("syn", "0", "import", "0")?;
    for index in ["0", "1"] {
        graph.node("place", index, "command", "run")?.add_output("gcd.def");
        graph.add_edge("place", index, "syn", "0")?;
    }
    graph
        .add_builtin("placemin", "0", Builtin::Minimum)?
        .set_select("cellarea");
    for index in ["0", "1"] {
        graph.add_edge("placemin", "0", "place", index)?;
    }
    graph.node("timing", "0", "opensta", "timing")?;
    graph.add_edge("timing", "0", "placemin", "0")?;
    Ok(graph)
}

fn create_example_flow(output: &Path) -> Result<()> {
    let graph = example_flow()?;
    graph.validate()?;

    let json = serde_json::to_string_pretty(&graph)?;
    std::fs::write(output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  chipflow run --flow {} --input gcd.v --set tool.command.exe=make",
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_parses_keypath_and_literal() {
        let manifest = Manifest::new();
        apply_set(&manifest, "tool.opensta.exe=/usr/bin/sta").unwrap();
        apply_set(&manifest, "option.jobs=3").unwrap();
        apply_set(&manifest, "tool.command.task.run.option.syn.0=-f,syn.mk").unwrap();

        assert_eq!(
            manifest.get_str(&["tool", "opensta", "exe"]).as_deref(),
            Some("/usr/bin/sta")
        );
        assert_eq!(manifest.get_f64(&["option", "jobs"]), Some(3.0));
        assert_eq!(
            manifest.get_strings(&["tool", "command", "task", "run", "option", "syn", "0"]),
            vec!["-f", "syn.mk"]
        );
        assert!(apply_set(&manifest, "novalue").is_err());
        assert!(apply_set(&manifest, "=1").is_err());
    }

    #[test]
    fn design_defaults_to_first_input_stem() {
        let inputs = vec![PathBuf::from("rtl/gcd.v"), PathBuf::from("rtl/alu.v")];
        assert_eq!(design_name(None, &inputs, "asicflow"), "gcd");
        assert_eq!(design_name(Some("top"), &inputs, "asicflow"), "top");
        assert_eq!(design_name(None, &[], "asicflow"), "asicflow");
    }

    #[test]
    fn step_flag_is_repeatable() {
        let cli = Cli::parse_from([
            "chipflow", "run", "--flow", "flow.json", "--input", "gcd.v", "--step", "syn", "--step",
            "place",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.steps, vec!["syn", "place"]);
        assert_eq!(args.input, vec![PathBuf::from("gcd.v")]);
    }

    #[test]
    fn example_flow_is_valid_and_known() {
        let graph = example_flow().unwrap();
        graph.validate().unwrap();
        registry().check_graph(&graph).unwrap();
        assert_eq!(graph.topological_layers().count(), 5);
    }
}
