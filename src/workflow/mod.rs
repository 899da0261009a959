//! Workflow Module
//!
//! Named tasks wired into a dependency graph, persisted in a run store and
//! driven by a polling scheduler.
//!
//! # Structure
//!
//! - [`config`]: Store location, payload directory and run options
//! - [`parser`]: YAML workflow definitions
//! - [`validator`]: Name uniqueness, dependency references and cycles
//! - [`planner`]: Which tasks a run activates, and when each may start
//! - [`store`]: SQLite persistence of tasks and runs
//! - [`engine`]: The scheduler itself

pub mod config;
pub mod engine;
pub mod parser;
pub mod planner;
pub mod store;
pub mod validator;

pub use config::{RunOptions, WorkflowConfig, DEFAULT_POLL_INTERVAL};
pub use engine::{RunReport, Workflow};
pub use parser::{load_definition, parse_definition, TaskDefinition, WorkflowDefinition};
pub use store::{RunRecord, Store};
pub use validator::{validate_tasks, ValidationError};
