//! CLI binary for running and validating pipeweave pipelines.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pipeweave", version, about = "DOT-based pipeline runner for attributed directed graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a .dot file
    Run {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,

        /// Working directory for tool execution
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Logs output directory
        #[arg(short, long, default_value = ".pipeweave/logs")]
        logs: PathBuf,

        /// Don't actually call LLMs or run tool commands (dry run)
        #[arg(long)]
        dry_run: bool,

        /// Maximum total spend across all nodes (USD). Pipeline aborts if exceeded.
        #[arg(long)]
        max_budget_usd: Option<f64>,

        /// Maximum number of node executions before aborting. Prevents runaway loops.
        #[arg(long, default_value = "200")]
        max_steps: usize,

        /// Resume from a checkpoint in the logs directory, if one exists.
        #[arg(long)]
        resume: bool,
    },

    /// Validate a pipeline .dot file
    Validate {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { pipeline, workdir, logs, dry_run, max_budget_usd, max_steps, resume } => {
            cmd_run(&pipeline, workdir.as_deref(), &logs, dry_run, max_budget_usd, max_steps, resume).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &std::path::Path) -> anyhow::Result<pipeweave_pipeline::PipelineGraph> {
    let source = std::fs::read_to_string(path)?;
    let dot = pipeweave_dot::parse(&source)?;
    let mut graph = pipeweave_pipeline::PipelineGraph::from_dot(dot)?;
    pipeweave_pipeline::apply_transforms(&mut graph)?;
    Ok(graph)
}

fn cmd_validate(path: &std::path::Path) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;
    let diagnostics = pipeweave_pipeline::validate(&graph);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            pipeweave_pipeline::Severity::Error => {
                has_error = true;
                "ERROR"
            }
            pipeweave_pipeline::Severity::Warning => "WARN",
            pipeweave_pipeline::Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &std::path::Path) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;

    println!("Pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }

    println!("Nodes: {}", graph.all_nodes().count());
    println!("Edges: {}", graph.all_edges().len());

    if let Some(start) = graph.start_node() {
        println!("Start: {} ({})", start.id, start.label);
    }
    if let Some(exit) = graph.exit_node() {
        println!("Exit: {} ({})", exit.id, exit.label);
    }

    println!("\nNodes:");
    for node in graph.all_nodes() {
        let node_type = node.node_type.as_deref().unwrap_or("(default)");
        println!("  {} [{}] shape={} type={}", node.id, node.label, node.shape, node_type);
    }

    Ok(())
}

async fn cmd_run(
    path: &std::path::Path,
    workdir: Option<&std::path::Path>,
    logs: &std::path::Path,
    dry_run: bool,
    max_budget_usd: Option<f64>,
    max_steps: usize,
    resume: bool,
) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;

    println!("Running pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }
    if dry_run {
        println!("(dry run mode -- no tool commands executed)");
    }

    let context = if resume {
        match pipeweave_pipeline::load_checkpoint(logs).await? {
            Some(checkpoint) => {
                println!("Resuming from checkpoint at node '{}'", checkpoint.current_node);
                let context = pipeweave_types::Context::new();
                context.apply_updates(checkpoint.context_values).await;
                context
            }
            None => {
                println!("No checkpoint found in {}; starting fresh", logs.display());
                pipeweave_types::Context::new()
            }
        }
    } else {
        pipeweave_types::Context::new()
    };

    if let Some(dir) = workdir {
        let abs = std::fs::canonicalize(dir)?;
        context.set("workdir", serde_json::Value::String(abs.to_string_lossy().into_owned())).await;
        println!("Working directory: {}", abs.display());
    }
    if dry_run {
        context.set("dry_run", serde_json::Value::Bool(true)).await;
    }
    if let Some(budget) = max_budget_usd {
        context.set("max_budget_usd", serde_json::json!(budget)).await;
        println!("Budget limit: ${:.2}", budget);
    }
    println!("Step limit: {}", max_steps);

    let interviewer = std::sync::Arc::new(pipeweave_pipeline::AutoApproveInterviewer);
    let registry = pipeweave_pipeline::default_registry_with_interviewer(interviewer);
    let config = pipeweave_pipeline::PipelineConfig { logs_root: logs.to_path_buf(), max_steps };
    let executor = pipeweave_pipeline::PipelineExecutor::new(registry, config);

    let mut events = executor.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(?event, "pipeline event");
        }
    });

    let result = executor.run_with_context(&graph, context).await?;

    match result.status {
        pipeweave_types::StageStatus::Success => println!("\nPipeline completed"),
        _ => println!("\nPipeline failed: {}", result.failure_reason.as_deref().unwrap_or("unknown reason")),
    }
    println!("Completed nodes: {:?}", result.completed_nodes);

    let total_cost: f64 = result
        .final_context
        .iter()
        .filter(|(k, _)| k.ends_with(".cost_usd"))
        .filter_map(|(_, v)| v.as_f64())
        .sum();
    if total_cost > 0.0 {
        println!("Total cost: ${:.4}", total_cost);
    }

    if result.status != pipeweave_types::StageStatus::Success {
        std::process::exit(1);
    }
    Ok(())
}
