//! Command-line interface for deckrun.
//!
//! Provides commands for starting runs, checking status, listing runs,
//! resuming and cancelling runs, resolving approvals and reading timelines.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config;
use crate::core::{EventTimeline, RunManager};
use crate::domain::{Event, Run, RunOptions, RunStatus};

/// deckrun - Resumable multi-phase pipeline executor
#[derive(Parser, Debug)]
#[command(name = "deckrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run and drive it until it pauses or finishes
    Run {
        /// JSON input file (reads JSON from stdin if neither this nor --topic is given)
        #[arg(short, long, conflicts_with = "topic")]
        input: Option<PathBuf>,

        /// Shorthand for the input {"topic": TEXT}
        #[arg(short, long)]
        topic: Option<String>,

        /// Minimum QA score (defaults to pipeline.quality_threshold)
        #[arg(long)]
        threshold: Option<f64>,

        /// Bound on content regenerations (defaults to pipeline.max_regenerations)
        #[arg(long)]
        max_regenerations: Option<u32>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show a run with its state and checkpoints
    Show {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Continue a pending or running run
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Resolve the pending approval of a paused run
    Approve {
        /// Run ID (UUID)
        run_id: String,

        /// Reject instead of approving (fails the run)
        #[arg(long)]
        reject: bool,

        /// Reviewer notes recorded with the decision
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Cancel a run
    Cancel {
        /// Run ID (UUID)
        run_id: String,

        /// Reason recorded on the timeline
        #[arg(short, long, default_value = "cancelled by user")]
        reason: String,
    },

    /// Print a run's events
    Events {
        /// Run ID (UUID)
        run_id: String,

        /// First sequence number to print
        #[arg(long, default_value = "1")]
        from: u64,

        /// Keep printing new events until the run ends
        #[arg(short, long)]
        follow: bool,
    },

    /// Print the artifact reference of a completed run
    Artifact {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                input,
                topic,
                threshold,
                max_regenerations,
            } => start_run(input, topic, threshold, max_regenerations).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Show { run_id } => show_run(&run_id).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Approve {
                run_id,
                reject,
                notes,
            } => resolve_approval(&run_id, !reject, notes).await,
            Commands::Cancel { run_id, reason } => cancel_run(&run_id, reason).await,
            Commands::Events {
                run_id,
                from,
                follow,
            } => show_events(&run_id, from, follow).await,
            Commands::Artifact { run_id } => show_artifact(&run_id).await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

/// Open the manager over the configured runs directory
async fn open_manager() -> Result<RunManager> {
    let cfg = config::config()?;

    let registry = cfg.registry();
    let missing = registry.missing();
    if !missing.is_empty() {
        tracing::warn!(?missing, "No executor configured for some phases");
    }

    RunManager::open_dir(cfg.runs_dir(), registry, cfg.pipeline.clone())
        .await
        .context("Failed to open run storage")
}

/// Read the run input from a file, --topic or stdin
fn read_input(input_file: Option<PathBuf>, topic: Option<String>) -> Result<Value> {
    if let Some(topic) = topic {
        if topic.trim().is_empty() {
            anyhow::bail!("Topic is empty");
        }
        return Ok(json!({ "topic": topic }));
    }

    let raw = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file>, --topic <text> or pipe JSON to stdin");
    };

    if raw.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    serde_json::from_str(&raw).context("Input is not valid JSON")
}

/// Create a run and drive it
async fn start_run(
    input_file: Option<PathBuf>,
    topic: Option<String>,
    threshold: Option<f64>,
    max_regenerations: Option<u32>,
) -> Result<()> {
    let input = read_input(input_file, topic)?;
    let manager = open_manager().await?;

    let defaults = manager.settings().run_options();
    let options = RunOptions {
        quality_threshold: threshold.unwrap_or(defaults.quality_threshold),
        max_regenerations: max_regenerations.unwrap_or(defaults.max_regenerations),
    };

    let run_id = manager.create(input, Some(options)).await?;
    eprintln!("[Run {} created]", run_id);

    let run = manager.drive(run_id).await?;
    report_outcome(&run, "")
}

/// Print how a drive ended; exits non-zero on failure
fn report_outcome(run: &Run, verb: &str) -> Result<()> {
    match run.status {
        RunStatus::Completed => {
            if let Some(artifact) = run.artifact() {
                println!("{}", serde_json::to_string_pretty(artifact)?);
            }
            eprintln!("\n[Run {} {}completed successfully]", run.id, verb);
        }
        RunStatus::PausedAwaitingApproval => {
            let phase = run
                .pending_approval
                .as_ref()
                .map(|request| request.phase.to_string())
                .unwrap_or_else(|| "?".to_string());
            eprintln!(
                "\n[Run {} paused after '{}'; approve with: deckrun approve {}]",
                run.id, phase, run.id
            );
        }
        RunStatus::Failed => {
            eprintln!(
                "\n[Run {} failed: {}]",
                run.id,
                run.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        RunStatus::Pending | RunStatus::Running => {
            eprintln!("\n[Run {} is {} at phase '{}']", run.id, run.status, run.current_phase);
        }
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;
    let run = manager.get(run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Status: {}", run.status);
    println!("Current phase: {}", run.current_phase);
    println!("Created: {}", run.created_at);
    println!("Updated: {}", run.updated_at);
    if let Some(request) = &run.pending_approval {
        println!("Awaiting approval for: {} (since {})", request.phase, request.requested_at);
    }
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }
    println!("\nPhase executions:");
    for (phase, count) in &run.attempt_count {
        println!("  {}: {}", phase, count);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let manager = open_manager().await?;
    let mut runs = manager.list().await;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    // Most recent first
    runs.reverse();

    println!("{:<38} {:<26} {:<12}", "RUN ID", "STATUS", "PHASE");
    println!("{}", "-".repeat(76));

    for run in runs.into_iter().take(limit) {
        println!("{:<38} {:<26} {:<12}", run.id, run.status, run.current_phase);
    }

    Ok(())
}

/// Print the full run detail as JSON
async fn show_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;
    let detail = manager.detail(run_id).await?;

    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

/// Continue a run from its latest checkpoint
async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;

    let existing = manager.get(run_id).await?;
    if !existing.can_advance() {
        anyhow::bail!(
            "Run {} is {} and cannot be resumed{}",
            run_id,
            existing.status,
            if existing.status == RunStatus::PausedAwaitingApproval {
                " (resolve the approval first)"
            } else {
                ""
            }
        );
    }

    eprintln!("[Resuming run {} at phase '{}']", run_id, existing.current_phase);
    let run = manager.drive(run_id).await?;
    report_outcome(&run, "resumed and ")
}

/// Approve (then continue) or reject a paused run
async fn resolve_approval(run_id_str: &str, approve: bool, notes: Option<String>) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;

    let run = manager.resolve_approval(run_id, approve, notes).await?;
    if !approve {
        eprintln!("[Run {} rejected]", run.id);
        return Ok(());
    }

    eprintln!("[Run {} approved; continuing at '{}']", run.id, run.current_phase);
    let run = manager.drive(run_id).await?;
    report_outcome(&run, "")
}

async fn cancel_run(run_id_str: &str, reason: String) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;

    let run = manager.cancel(run_id, reason).await?;
    eprintln!(
        "[Run {} cancelled: {}]",
        run.id,
        run.error.as_deref().unwrap_or("cancelled")
    );
    Ok(())
}

fn print_event(event: &Event) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Print stored events; with `follow`, keep polling the log until a
/// terminal event shows up (the driver may live in another process)
async fn show_events(run_id_str: &str, from: u64, follow: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;

    let mut next = from.max(1);
    for event in manager.event_snapshot(run_id, next).await? {
        next = event.seq + 1;
        print_event(&event)?;
    }

    if !follow || manager.get(run_id).await?.is_terminal() {
        return Ok(());
    }

    let runs_dir = config::runs_dir()?;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let timeline = EventTimeline::persistent(&runs_dir);
        let events = timeline.snapshot(run_id, next).await?;
        for event in &events {
            next = event.seq + 1;
            print_event(event)?;
        }
        if events.last().is_some_and(Event::is_terminal) {
            return Ok(());
        }
    }
}

async fn show_artifact(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let manager = open_manager().await?;
    let artifact = manager.artifact(run_id).await?;

    println!("{}", serde_json::to_string_pretty(&artifact)?);
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("deckrun configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!();
    println!("Pipeline:");
    let gated: Vec<String> = cfg
        .pipeline
        .approval_phases
        .iter()
        .map(ToString::to_string)
        .collect();
    println!(
        "  Approval phases:   {}",
        if gated.is_empty() { "(none)".to_string() } else { gated.join(", ") }
    );
    println!("  Quality threshold: {}", cfg.pipeline.quality_threshold);
    println!("  Max regenerations: {}", cfg.pipeline.max_regenerations);
    println!(
        "  Retry:             {} attempts, {}ms initial, {}ms max, x{}",
        cfg.pipeline.retry.max_attempts,
        cfg.pipeline.retry.initial_delay_ms,
        cfg.pipeline.retry.max_delay_ms,
        cfg.pipeline.retry.backoff_multiplier
    );
    println!();
    println!("Executors:");
    if cfg.executors.is_empty() {
        println!("  (none configured)");
    }
    for (phase, spec) in &cfg.executors {
        println!(
            "  {:<10} {} {} (timeout {}s)",
            phase,
            spec.command,
            spec.args.join(" "),
            spec.timeout_seconds
        );
    }

    Ok(())
}
