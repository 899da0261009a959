//! jobgraph CLI Entry Point
//!
//! Runs workflow definitions and inspects their run store. The same binary
//! doubles as the runner of every task it starts, serving the built-in
//! function registry.
//!
//! # Usage
//!
//! ```bash
//! # Run every task of a workflow
//! jobgraph run workflow.yaml --db runs.sqlite
//!
//! # Run one task and its unfinished dependencies, even if it succeeded before
//! jobgraph run workflow.yaml --db runs.sqlite --task report --rerun
//!
//! # Preview which tasks would run
//! jobgraph run workflow.yaml --db runs.sqlite --dry-run
//!
//! # Latest run of every task, then every run of one task
//! jobgraph status --db runs.sqlite
//! jobgraph history --db runs.sqlite report
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use log::{error, info};

use jobgraph::workflow::store::RunRecord;
use jobgraph::workflow::{load_definition, validate_tasks, Store, DEFAULT_POLL_INTERVAL};
use jobgraph::{builtins, runner, RunOptions, RunReport, TaskStatus, Workflow, WorkflowConfig};
use jobgraph::{APP_NAME, DEFAULT_LOG_TARGET, VERSION};

#[derive(Parser)]
#[command(name = "jobgraph")]
#[command(about = "Persistent task workflows on local processes or batch clusters")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file
    Run {
        /// Path to the workflow YAML file
        file: PathBuf,

        /// SQLite run store, created if missing
        #[arg(long)]
        db: PathBuf,

        /// Directory for payload files
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Task to run (repeatable); every task not flagged skip by default
        #[arg(short, long = "task")]
        tasks: Vec<String>,

        /// Run tasks again even if they already succeeded
        #[arg(long)]
        rerun: bool,

        /// Only report which tasks would run
        #[arg(long)]
        dry_run: bool,

        /// Do not pull in unfinished dependencies
        #[arg(long)]
        no_deps: bool,

        /// Seconds between two status checks
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs_f64())]
        interval: f64,
    },

    /// Validate a workflow file without touching any store
    Validate {
        /// Path to the workflow YAML file
        file: PathBuf,
    },

    /// Show the latest run of every task
    Status {
        /// SQLite run store
        #[arg(long)]
        db: PathBuf,
    },

    /// Show every run of a task, oldest first
    History {
        /// SQLite run store
        #[arg(long)]
        db: PathBuf,

        /// Task name
        task: String,
    },
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "{} [{}] {}", time, record.level(), record.args())
                }
                _ => writeln!(buf, "{} {}", time, record.args()),
            }
        })
        .init();
}

fn paint(status: Option<TaskStatus>) -> ColoredString {
    match status {
        None => "-".dimmed(),
        Some(TaskStatus::Pending) => "pending".yellow(),
        Some(TaskStatus::Running) => "running".cyan(),
        Some(TaskStatus::Success) => "success".green(),
        Some(TaskStatus::Error) => "error".red().bold(),
    }
}

fn run_workflow(
    file: PathBuf,
    config: WorkflowConfig,
    options: RunOptions,
) -> Result<RunReport, Box<dyn std::error::Error>> {
    let tasks = load_definition(&file)?.into_tasks(None);
    let mut workflow = Workflow::new(tasks, config)?;
    let report = workflow.run(options)?;

    if report.processed {
        println!();
        for (name, status) in &report.statuses {
            println!("  {:<24} {}", name, paint(Some(*status)));
        }
    } else {
        println!("{} {}", "Would run:".cyan().bold(), report.planned.join(", "));
    }

    Ok(report)
}

fn validate_workflow(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let tasks = load_definition(&file)?.into_tasks(None);
    let order = validate_tasks(&tasks, DEFAULT_LOG_TARGET)?;
    let names: Vec<&str> = order.iter().map(|&i| tasks[i].label()).collect();

    println!("{} {} tasks", "Valid:".green().bold(), tasks.len());
    println!("  {}", names.join(" -> "));
    Ok(())
}

fn print_records(records: &[RunRecord]) {
    if records.is_empty() {
        println!("{}", "No runs recorded".dimmed());
        return;
    }

    println!(
        "{:<24} {:<8} {:<6} {:<20} {:<20} {}",
        "TASK", "STATUS", "ACTIVE", "STARTED", "ENDED", "RESULT"
    );
    for record in records {
        let result = record
            .result
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{:<24} {:<8} {:<6} {:<20} {:<20} {}",
            record.task,
            paint(Some(record.status)),
            if record.active { "yes" } else { "no" },
            record.start_time.as_deref().unwrap_or("-"),
            record.end_time.as_deref().unwrap_or("-"),
            result
        );
    }
}

fn execute(command: Commands) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Commands::Run {
            file,
            db,
            workdir,
            tasks,
            rerun,
            dry_run,
            no_deps,
            interval,
        } => {
            if !interval.is_finite() || interval <= 0.0 {
                return Err(format!("invalid poll interval: {}", interval).into());
            }

            let mut config = WorkflowConfig::new(db);
            if let Some(dir) = workdir {
                config = config.with_workdir(dir);
            }

            let mut options = RunOptions::for_tasks(tasks)
                .with_rerun(rerun)
                .with_poll_interval(Duration::from_secs_f64(interval));
            if dry_run {
                options = options.dry_run();
            }
            if no_deps {
                options = options.without_dependencies();
            }

            let report = run_workflow(file, config, options)?;
            Ok(!report.processed || report.is_success())
        }
        Commands::Validate { file } => {
            validate_workflow(file)?;
            Ok(true)
        }
        Commands::Status { db } => {
            print_records(&Store::open(db)?.latest()?);
            Ok(true)
        }
        Commands::History { db, task } => {
            let store = Store::open(db)?;
            if store.task_id(&task)?.is_none() {
                return Err(format!("unknown task '{}'", task).into());
            }
            print_records(&store.history(&task)?);
            Ok(true)
        }
    }
}

fn main() -> ExitCode {
    if let Some(code) = runner::dispatch(&builtins::registry()) {
        return code;
    }

    let cli = Cli::parse();
    setup_logging(cli.verbose);
    info!("{} v{}", APP_NAME, VERSION);

    match execute(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("One or more tasks failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
