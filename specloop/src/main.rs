//! Task orchestration CLI.
//!
//! Reads the task graph (`tasks.json`) and specification (`spec.md`) under a
//! project root, keeps run state in `.specloop/`, and drives every task
//! through verification and correction until the graph is complete or stuck.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use specloop::cancel::{CancelToken, cancel_on_signal};
use specloop::exit_codes;
use specloop::io::init::{InitOptions, init_workspace};
use specloop::orchestrator::{RunReport, RunStop, TaskReport};
use specloop::start::{load_status, open_run};
use specloop::validate::validate_workspace;

#[derive(Parser)]
#[command(
    name = "specloop",
    version,
    about = "Self-healing task orchestration over an anchored specification"
)]
struct Cli {
    /// Project root containing `spec.md`, `tasks.json` and `.specloop/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.specloop/` with a default config, plus sample `spec.md` and `tasks.json`.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check config, task graph and specification anchors.
    Validate,
    /// Run every eligible task until the graph is complete, blocked or halted.
    Run {
        /// Print the final report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print persisted task states without running anything.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Revert tasks left queued or in progress by an interrupted run.
    Recover,
}

fn main() {
    specloop::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Validate => cmd_validate(&cli.root),
        Command::Run { json } => cmd_run(&cli.root, json),
        Command::Status { json } => cmd_status(&cli.root, json),
        Command::Recover => cmd_recover(&cli.root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let outcome = validate_workspace(root)?;
    println!("{} tasks, {} anchors", outcome.tasks, outcome.anchors);
    for id in &outcome.missing_anchors {
        println!("warning: no anchor for '{id}'");
    }
    for id in &outcome.ambiguous_anchors {
        println!("warning: anchor '{id}' is declared more than once");
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, json: bool) -> Result<i32> {
    let cancel = CancelToken::new();
    let mut opened = open_run(root, &cancel)?;
    cancel_on_signal(&cancel)?;
    if !opened.reconcile.reset.is_empty() || !opened.reconcile.dropped.is_empty() {
        info!(
            reset = ?opened.reconcile.reset,
            dropped = ?opened.reconcile.dropped,
            "persisted state reconciled"
        );
    }
    let report = opened.orchestrator.run_with(&cancel, |task_id, result| {
        info!(task = %task_id, ?result, "task pass finished");
    })?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize run report")?
        );
    } else {
        print_report(&report);
    }
    Ok(exit_code(&report.stop))
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let tasks = load_status(root)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&tasks).context("serialize task states")?
        );
    } else {
        print_tasks(&tasks);
    }
    Ok(exit_codes::OK)
}

fn cmd_recover(root: &Path) -> Result<i32> {
    let opened = open_run(root, &CancelToken::new())?;
    let recovered = opened.orchestrator.recovered();
    if recovered.is_empty() {
        println!("nothing to recover");
    }
    for change in recovered {
        println!("{}: {} -> {}", change.task_id, change.from, change.to);
    }
    Ok(exit_codes::OK)
}

fn exit_code(stop: &RunStop) -> i32 {
    match stop {
        RunStop::Complete => exit_codes::OK,
        RunStop::Exhausted { .. } | RunStop::Halted { .. } => exit_codes::HALTED,
        RunStop::Blocked { .. } => exit_codes::BLOCKED,
        RunStop::Cancelled => exit_codes::CANCELLED,
    }
}

fn print_report(report: &RunReport) {
    print_tasks(&report.tasks);
    match &report.stop {
        RunStop::Complete => println!("complete"),
        RunStop::Exhausted { halted } => println!("finished; halted: {}", halted.join(", ")),
        RunStop::Blocked { waiting } => println!("blocked; waiting: {}", waiting.join(", ")),
        RunStop::Halted {
            task_id,
            root_cause,
        } => println!("halted at {task_id}: {root_cause}"),
        RunStop::Cancelled => println!("cancelled"),
    }
}

fn print_tasks(tasks: &[TaskReport]) {
    for task in tasks {
        println!("{}\t{}\t{} attempts", task.id, task.status, task.attempts);
    }
}
