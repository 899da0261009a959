//! jobgraph - Persistent Task Workflows
//!
//! Runs named units of work as separate processes, either on the local host
//! or as jobs on an LSF-style batch cluster, and keeps the history of every
//! run in a SQLite file so that a workflow can be resumed, partially re-run,
//! or inspected after the scheduler exits.
//!
//! # Architecture
//!
//! - [`task`]: One unit of work and its execution lifecycle
//! - [`execution`]: Payload format, runner entry point, local and cluster
//!   backends, and [`Batch`]
//! - [`workflow`]: Dependency graphs, the run store and the scheduler
//! - [`registry`]: Named functions a runner process can call
//! - [`builtins`]: The functions served by the `jobgraph` binary
//!
//! # Example
//!
//! ```rust,no_run
//! use std::process::ExitCode;
//! use std::time::Duration;
//! use jobgraph::{runner, Registry, RunOptions, Task, Value, Workflow, WorkflowConfig};
//!
//! fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
//!     let registry = Registry::default()
//!         .register("double", |args, _| Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2)));
//!
//!     // The scheduler re-executes this binary to run each task.
//!     if let Some(code) = runner::dispatch(&registry) {
//!         return Ok(code);
//!     }
//!
//!     let tasks = vec![
//!         Task::new("double").named("first").with_arg(21),
//!         Task::new("double").named("second").takes_input_from("first"),
//!     ];
//!
//!     let mut workflow = Workflow::new(tasks, WorkflowConfig::new("runs.sqlite"))?;
//!     let report = workflow.run(RunOptions::all().with_poll_interval(Duration::from_secs(1)))?;
//!     println!("success: {}", report.is_success());
//!     Ok(ExitCode::SUCCESS)
//! }
//! ```

pub mod builtins;
pub mod error;
pub mod execution;
pub mod registry;
pub mod task;
pub mod value;
pub mod workflow;

// Re-export commonly used types
pub use error::{BoxError, Error, Result};
pub use execution::runner;
pub use execution::Batch;
pub use registry::Registry;
pub use task::{Task, TaskStatus};
pub use value::{Kwargs, Value};
pub use workflow::{RunOptions, RunReport, Workflow, WorkflowConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "jobgraph";

/// Log target used when none is injected.
pub const DEFAULT_LOG_TARGET: &str = "jobgraph";
