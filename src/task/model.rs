//! Task Data Model
//!
//! A [`Task`] describes one unit of work: the registry function to call, its
//! arguments, the tasks it waits for, and where it runs. It also carries the
//! runtime handle of its current execution (see [`super::lifecycle`]).
//!
//! ```
//! use jobgraph::task::{ClusterConfig, LogMode, Task};
//!
//! let task = Task::new("refresh")
//!     .named("proteins")
//!     .with_arg("uniprot")
//!     .depends_on("download")
//!     .takes_input_from("checksums")
//!     .with_cluster(ClusterConfig::new().with_queue("production").with_memory(4000))
//!     .with_log(LogMode::Files("logs/proteins".into()));
//!
//! assert_eq!(task.dependencies(), vec!["download", "checksums"]);
//! ```

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Child;

use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_REGISTRY;
use crate::value::{Kwargs, Value};
use crate::DEFAULT_LOG_TARGET;

/// Memory reserved for a cluster job when none is configured, in MB.
pub const DEFAULT_MEMORY_MB: u32 = 100;

/// Execution status of a task or of a persisted run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Not started, or started but not observed yet
    #[default]
    Pending,
    /// Executing
    Running,
    /// Exited successfully
    Success,
    /// Failed, was stopped, or a dependency failed
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }

    /// Column value used by the run store; pending is stored as NULL.
    pub fn to_db(self) -> Option<&'static str> {
        match self {
            TaskStatus::Pending => None,
            TaskStatus::Running => Some("running"),
            TaskStatus::Success => Some("success"),
            TaskStatus::Error => Some("error"),
        }
    }

    /// Inverse of [`to_db`](Self::to_db). Unrecognized values count as errors.
    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            None => TaskStatus::Pending,
            Some("running") => TaskStatus::Running,
            Some("success") => TaskStatus::Success,
            Some(_) => TaskStatus::Error,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// What happens to the stdout and stderr of a task.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LogMode {
    /// Inherit the scheduler's streams; cluster jobs use the site default
    #[default]
    Inherit,
    /// Send both streams to the null device
    Discard,
    /// Write `<prefix>.out` and `<prefix>.err`
    Files(PathBuf),
}

impl LogMode {
    /// Paths of the stdout and stderr files, for [`LogMode::Files`].
    pub fn paths(&self) -> Option<(PathBuf, PathBuf)> {
        match self {
            LogMode::Files(prefix) => {
                let mut out = prefix.clone().into_os_string();
                out.push(".out");
                let mut err = prefix.clone().into_os_string();
                err.push(".err");
                Some((PathBuf::from(out), PathBuf::from(err)))
            }
            _ => None,
        }
    }
}

/// Batch-cluster submission parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Queue to submit to
    pub queue: Option<String>,
    /// Job name; the task name is used when unset
    pub job_name: Option<String>,
    /// Number of slots
    pub cpu: Option<u32>,
    /// Memory reservation and hard limit, in MB
    pub memory: u32,
    /// Temporary disk space reservation, in MB
    pub tmp: Option<u32>,
    /// Submission command
    pub submit_command: String,
    /// Status query command
    pub status_command: String,
    /// Cancellation command
    pub cancel_command: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            queue: None,
            job_name: None,
            cpu: None,
            memory: DEFAULT_MEMORY_MB,
            tmp: None,
            submit_command: "bsub".to_string(),
            status_command: "bjobs".to_string(),
            cancel_command: "bkill".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_memory(mut self, megabytes: u32) -> Self {
        self.memory = megabytes;
        self
    }

    pub fn with_tmp(mut self, megabytes: u32) -> Self {
        self.tmp = Some(megabytes);
        self
    }

    /// Overrides the `bsub`/`bjobs`/`bkill` command names.
    pub fn with_commands(
        mut self,
        submit: impl Into<String>,
        status: impl Into<String>,
        cancel: impl Into<String>,
    ) -> Self {
        self.submit_command = submit.into();
        self.status_command = status.into();
        self.cancel_command = cancel.into();
        self
    }
}

/// Where a task executes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Backend {
    /// Child process of the scheduler
    #[default]
    Local,
    /// Job submitted to a batch cluster
    Cluster(ClusterConfig),
}

/// How to start the runner process for a task.
///
/// The command line is `<program> <args...> <infile> <outfile>`; `registry`
/// is written into the payload header and must match the registry the
/// program serves.
#[derive(Debug, Clone, PartialEq)]
pub struct Launcher {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub registry: String,
}

impl Launcher {
    /// Runner invocation of an arbitrary program.
    pub fn new(program: impl Into<PathBuf>, registry: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from(crate::execution::runner::RUNNER_ARG)],
            registry: registry.into(),
        }
    }

    /// Re-executes the current binary in runner mode.
    pub fn current_exe(registry: impl Into<String>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, registry))
    }

    /// Replaces the arguments placed between the program and the payload files.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Full command line for one execution.
    pub fn command(&self, infile: &std::path::Path, outfile: &std::path::Path) -> Vec<OsString> {
        let mut command = Vec::with_capacity(self.args.len() + 3);
        command.push(self.program.clone().into_os_string());
        command.extend(self.args.iter().cloned());
        command.push(infile.as_os_str().to_owned());
        command.push(outfile.as_os_str().to_owned());
        command
    }
}

/// Paths of the payload and result files of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFiles {
    pub infile: PathBuf,
    pub outfile: PathBuf,
}

/// Runtime handle of a started task.
#[derive(Debug)]
pub(crate) enum Handle {
    /// Child process spawned by this process
    Local(Child),
    /// Process started by an earlier scheduler, tracked by pid
    Adopted(u32),
    /// Cluster job id
    Cluster(u64),
}

/// A unit of work.
#[derive(Debug)]
pub struct Task {
    /// Identifier; mandatory inside a workflow
    pub name: Option<String>,
    /// Registry key of the function to run
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    /// Tasks that must succeed before this one starts
    pub requires: Vec<String>,
    /// Tasks whose results are prepended to `args`
    pub input: Vec<String>,
    pub backend: Backend,
    pub log: LogMode,
    /// Excluded when a workflow runs every task
    pub skip: bool,
    /// Runner invocation; the current executable when unset
    pub launcher: Option<Launcher>,
    /// Registry the current executable serves; only used without a launcher
    pub registry: Option<String>,

    pub(crate) log_target: String,
    pub(crate) handle: Option<Handle>,
    pub(crate) status: TaskStatus,
    pub(crate) files: Option<PayloadFiles>,
    pub(crate) output: Option<Value>,
}

impl Task {
    /// Creates a task calling the registry function `function`.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            name: None,
            function: function.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            requires: Vec::new(),
            input: Vec::new(),
            backend: Backend::Local,
            log: LogMode::Inherit,
            skip: false,
            launcher: None,
            registry: None,
            log_target: DEFAULT_LOG_TARGET.to_string(),
            handle: None,
            status: TaskStatus::Pending,
            files: None,
            output: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Appends one positional argument.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Adds an ordering-only dependency.
    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.requires.push(task.into());
        self
    }

    /// Adds a dependency whose result becomes a leading argument.
    pub fn takes_input_from(mut self, task: impl Into<String>) -> Self {
        self.input.push(task.into());
        self
    }

    pub fn with_cluster(mut self, config: ClusterConfig) -> Self {
        self.backend = Backend::Cluster(config);
        self
    }

    pub fn with_log(mut self, log: LogMode) -> Self {
        self.log = log;
        self
    }

    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Names the registry of the current executable, for tasks run without
    /// an explicit launcher.
    pub fn with_registry(mut self, name: impl Into<String>) -> Self {
        self.registry = Some(name.into());
        self
    }

    /// Target of the records logged while the task executes.
    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    /// `requires` followed by `input`.
    pub fn dependencies(&self) -> Vec<&str> {
        self.requires
            .iter()
            .chain(self.input.iter())
            .map(String::as_str)
            .collect()
    }

    /// Registry name written into the payload.
    pub fn registry(&self) -> &str {
        match &self.launcher {
            Some(launcher) => &launcher.registry,
            None => self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY),
        }
    }

    pub fn log_target(&self) -> &str {
        &self.log_target
    }

    /// Name for log messages; falls back to the function key.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.function)
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Result cached by the last [`collect`](Self::collect).
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Payload files of the current execution, until cleaned.
    pub fn files(&self) -> Option<&PayloadFiles> {
        self.files.as_ref()
    }

    pub fn job_id(&self) -> Option<u64> {
        match self.handle {
            Some(Handle::Cluster(id)) => Some(id),
            _ => None,
        }
    }

    /// Process id of a local execution.
    pub fn pid(&self) -> Option<u32> {
        match &self.handle {
            Some(Handle::Local(child)) => Some(child.id()),
            Some(Handle::Adopted(pid)) => Some(*pid),
            _ => None,
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.handle.is_some()
    }
}
