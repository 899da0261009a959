//! Workflow Configuration
//!
//! [`WorkflowConfig`] holds what a workflow needs for its whole life: where
//! the store lives, where payload files go, which registry runs its tasks,
//! and the log target. [`RunOptions`]
//! holds what changes from one [`run`](super::Workflow::run) to the next.

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::DEFAULT_REGISTRY;
use crate::DEFAULT_LOG_TARGET;

/// Interval between two scheduling ticks when none is given.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Construction-time settings of a [`Workflow`](super::Workflow).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    /// SQLite file holding tasks and runs; created if missing
    pub database: PathBuf,
    /// Directory for payload files; the system temp directory when unset
    pub workdir: Option<PathBuf>,
    /// Registry served by the current executable, for tasks without a
    /// launcher or registry of their own
    pub registry: String,
    /// Target of every log record emitted by the workflow
    pub log_target: String,
}

impl WorkflowConfig {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            workdir: None,
            registry: DEFAULT_REGISTRY.to_string(),
            log_target: DEFAULT_LOG_TARGET.to_string(),
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_registry(mut self, name: impl Into<String>) -> Self {
        self.registry = name.into();
        self
    }

    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }
}

/// Options of a single workflow run.
///
/// ```
/// use std::time::Duration;
/// use jobgraph::workflow::RunOptions;
///
/// let options = RunOptions::for_tasks(["report"])
///     .with_rerun(true)
///     .with_poll_interval(Duration::from_secs(5));
///
/// assert!(options.include_deps);
/// assert!(options.process);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Tasks to run; every task not flagged `skip` when empty
    pub tasks: Vec<String>,
    /// Run tasks again even if their active run succeeded
    pub rerun: bool,
    /// Sleep between two scheduling ticks
    pub poll_interval: Duration,
    /// When false, only plan and report
    pub process: bool,
    /// Follow `requires` dependencies when planning and starting
    pub include_deps: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            rerun: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            process: true,
            include_deps: true,
        }
    }
}

impl RunOptions {
    /// Runs every task not flagged `skip`.
    pub fn all() -> Self {
        Self::default()
    }

    /// Runs the named tasks and, unless disabled, their unfinished
    /// dependencies.
    pub fn for_tasks<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Plans without writing to the store or starting anything.
    pub fn dry_run(mut self) -> Self {
        self.process = false;
        self
    }

    /// Ignores `requires` dependencies; `input` dependencies still gate the
    /// start of a task.
    pub fn without_dependencies(mut self) -> Self {
        self.include_deps = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_options_defaults() {
        let options = RunOptions::all();
        assert!(options.tasks.is_empty());
        assert!(!options.rerun);
        assert!(options.process);
        assert!(options.include_deps);
        assert_eq!(options.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_run_options_builders() {
        let options = RunOptions::for_tasks(vec!["a".to_string(), "b".to_string()])
            .dry_run()
            .without_dependencies();
        assert_eq!(options.tasks, vec!["a", "b"]);
        assert!(!options.process);
        assert!(!options.include_deps);
    }

    #[test]
    fn test_workflow_config() {
        let config = WorkflowConfig::new("/tmp/wf.sqlite")
            .with_workdir("/scratch")
            .with_registry("etl")
            .with_log_target("etl");
        assert_eq!(config.database, PathBuf::from("/tmp/wf.sqlite"));
        assert_eq!(config.registry, "etl");
        assert_eq!(WorkflowConfig::new("x").registry, "default");
        assert_eq!(config.workdir, Some(PathBuf::from("/scratch")));
        assert_eq!(config.log_target, "etl");
        assert_eq!(WorkflowConfig::new("x").log_target, "jobgraph");
    }
}
