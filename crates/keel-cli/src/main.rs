//! Keel - incremental-checkout CI orchestration CLI
//!
//! The `keel` command runs a pipeline definition against a persistent
//! workspace.
//!
//! ## Commands
//!
//! - `run`: Synchronize the workspace and run the selected jobs stage by stage
//! - `plan`: Show which jobs the current invocation would run
//! - `classify`: Print the trigger derived from the CI environment
//! - `sync`: Synchronize the workspace only
//! - `init`: Write a starter `keel.toml`

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use keel_ci::{
    InvocationContext, JobSelector, Pipeline, PipelineDefinition, PipelineDeps, PipelineOutcome,
    PipelineReport, TriggerClassifier, DEFAULT_CONFIG_FILE, STARTER_TEMPLATE,
};
use keel_core::{JobOutcome, RunMode, RunResult, StageState, Workspace};

#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Keel Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental-checkout CI pipeline runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize the workspace and run the selected jobs
    Run {
        #[command(flatten)]
        definition: DefinitionArgs,

        /// Write the full pipeline report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show the jobs the current invocation would run, without running them
    Plan {
        #[command(flatten)]
        definition: DefinitionArgs,
    },

    /// Print the trigger derived from the CI environment as JSON
    Classify,

    /// Synchronize the workspace without running any job
    Sync {
        #[command(flatten)]
        definition: DefinitionArgs,
    },

    /// Write a starter pipeline definition
    Init {
        /// Directory or file to write (default: ./keel.toml)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Where the definition lives and the settings the environment may override.
#[derive(Args, Debug, Clone)]
struct DefinitionArgs {
    /// Pipeline definition file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Persistent workspace directory
    #[arg(long, env = "KEEL_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Canonical remote the workspace tracks
    #[arg(long, env = "KEEL_REMOTE_URL")]
    remote_url: Option<String>,

    /// Directory receiving published artifacts
    #[arg(long, env = "KEEL_ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    /// Maximum concurrently running jobs per stage
    #[arg(long, env = "KEEL_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Activate a manual job (repeatable; adds to KEEL_MANUAL_JOBS)
    #[arg(long = "activate", value_name = "JOB")]
    activate: Vec<String>,
}

impl DefinitionArgs {
    fn load(&self) -> Result<PipelineDefinition> {
        let mut definition = PipelineDefinition::load(&self.config)
            .with_context(|| format!("Failed to load {}", self.config.display()))?;
        self.apply_overrides(&mut definition);
        Ok(definition)
    }

    fn apply_overrides(&self, definition: &mut PipelineDefinition) {
        let settings = &mut definition.workspace;
        if let Some(root) = &self.workspace {
            settings.root = root.clone();
        }
        if let Some(url) = &self.remote_url {
            settings.remote_url = Some(url.clone());
        }
        if let Some(dir) = &self.artifact_dir {
            settings.artifact_dir = dir.clone();
        }
        if let Some(n) = self.max_parallel {
            settings.max_parallel = n;
        }
    }

    fn context(&self) -> InvocationContext {
        self.activate
            .iter()
            .fold(InvocationContext::from_env(), |ctx, job| {
                ctx.with_manual_job(job.clone())
            })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    keel_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run { definition, report } => cmd_run(&definition, report.as_deref()).await,
        Commands::Plan { definition } => cmd_plan(&definition),
        Commands::Classify => cmd_classify(),
        Commands::Sync { definition } => cmd_sync(&definition).await,
        Commands::Init { path, force } => cmd_init(&path, force),
    }
}

fn build_pipeline(args: &DefinitionArgs) -> Result<Pipeline> {
    let definition = args.load()?;
    let deps = PipelineDeps::production(&definition);
    Pipeline::new(definition, deps).context("Invalid pipeline definition")
}

async fn cmd_run(args: &DefinitionArgs, report_path: Option<&Path>) -> Result<()> {
    let pipeline = build_pipeline(args)?;
    let context = args.context();
    let workspace = Workspace::new(&pipeline.definition().workspace.root);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pipeline");
            let _ = cancel_tx.send(true);
        }
    });

    let report = pipeline.execute(&context, workspace, Some(cancel_rx)).await;

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    print_report(&report);

    if report.is_failure() {
        anyhow::bail!("pipeline failed");
    }
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!("Pipeline: {}", report.pipeline_id);
    println!(
        "Trigger:  {} on {} @ {}",
        report.trigger.kind(),
        report.trigger.branch_ref(),
        report.trigger.short_commit()
    );
    if let Some(sync) = &report.sync {
        let mode = if sync.cloned() { "cold clone" } else { "incremental" };
        println!("Sync:     {} ({}ms)", mode, sync.duration_ms);
        for lock in &sync.removed_locks {
            println!("  removed stale lock {}", lock.display());
        }
    }
    println!();

    let run = match &report.outcome {
        PipelineOutcome::Aborted { error } => {
            println!("Status: ✗ ABORTED");
            println!("  {error}");
            return;
        }
        PipelineOutcome::Completed { run, .. } => run,
    };

    for stage in &run.stages {
        let marker = match stage.state {
            StageState::Succeeded => "✓",
            StageState::Failed => "✗",
            _ => "-",
        };
        println!("{} {} ({:?})", marker, stage.name, stage.state);
        for result in &stage.results {
            println!("    {}", job_line(result));
        }
    }

    if !run.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &run.artifacts {
            let expiry = artifact
                .expires_at
                .map(|t| format!(", expires {}", t.format("%Y-%m-%d %H:%M UTC")))
                .unwrap_or_default();
            println!(
                "  {} ({} files{})",
                artifact.location.path.display(),
                artifact.files.len(),
                expiry
            );
        }
    }
    for failure in &run.publish_failures {
        println!("  ⚠ {}: artifact publish failed: {}", failure.job_name, failure.error);
    }

    println!();
    println!("Duration: {}ms", report.duration_ms);
    println!("Status: {:?}", run.state);
}

fn job_line(result: &RunResult) -> String {
    let (marker, detail) = match &result.outcome {
        JobOutcome::Succeeded => ("✓", String::new()),
        JobOutcome::Failed(err) if result.allowed_to_fail => ("⚠", format!(" allowed to fail: {err}")),
        JobOutcome::Failed(err) => ("✗", format!(" {err}")),
        JobOutcome::Skipped(_) => ("-", " awaiting manual activation".to_string()),
        JobOutcome::Cancelled => ("✗", " cancelled".to_string()),
    };
    format!("{} {} ({}ms){}", marker, result.job_name, result.duration_ms, detail)
}

fn cmd_plan(args: &DefinitionArgs) -> Result<()> {
    let definition = args.load()?;
    let context = args.context();
    let trigger = TriggerClassifier::classify(&context);
    let selection = JobSelector::select(&definition.graph, &trigger);

    println!(
        "Trigger: {} on {} @ {}",
        trigger.kind(),
        trigger.branch_ref(),
        trigger.commit_id()
    );
    if let Some((project, branch)) = trigger.merge_source() {
        println!("Merge:   {project}:{branch}");
    }
    println!();

    let mut current_stage: Option<&str> = None;
    for job in selection.jobs() {
        if current_stage != Some(job.stage.as_str()) {
            println!("{}", job.stage);
            current_stage = Some(job.stage.as_str());
        }
        let note = match job.run_mode {
            RunMode::Manual if context.manual_jobs.contains(&job.name) => " (manual, activated)",
            RunMode::Manual => " (manual)",
            RunMode::OnFailureAllowed => " (allowed to fail)",
            RunMode::Always => "",
        };
        println!("  ✓ {}{}", job.name, note);
    }

    if !selection.excluded().is_empty() {
        println!();
        println!("Excluded:");
        for excluded in selection.excluded() {
            println!("  ✗ {}: {}", excluded.job, excluded.reason);
        }
    }
    Ok(())
}

fn cmd_classify() -> Result<()> {
    let trigger = TriggerClassifier::classify(&InvocationContext::from_env());
    println!("{}", serde_json::to_string_pretty(&trigger)?);
    Ok(())
}

async fn cmd_sync(args: &DefinitionArgs) -> Result<()> {
    let pipeline = build_pipeline(args)?;
    let workspace = Workspace::new(&pipeline.definition().workspace.root);

    let outcome = pipeline
        .sync_only(&args.context(), workspace)
        .await
        .context("Workspace synchronization failed")?;

    println!(
        "✓ {} at {}",
        outcome.workspace.root.display(),
        outcome.workspace.current_commit.as_deref().unwrap_or("?")
    );
    if let Some(head) = &outcome.workspace.integrated_head {
        println!("  integrated head {head}");
    }
    for step in &outcome.report.steps {
        println!("  {}", serde_json::to_string(step)?);
    }
    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    let target = if path.is_dir() {
        path.join(DEFAULT_CONFIG_FILE)
    } else {
        path.to_path_buf()
    };

    if target.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            target.display()
        );
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, STARTER_TEMPLATE)
        .with_context(|| format!("Failed to write {}", target.display()))?;

    println!("✓ Wrote starter pipeline to {}", target.display());
    Ok(())
}
