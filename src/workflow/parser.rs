//! Workflow Definition Files
//!
//! Loads task graphs from YAML so the command-line scheduler can run them:
//!
//! ```yaml
//! tasks:
//!   - name: fetch
//!     function: shell
//!     args: "curl -s https://example.org/count"
//!   - name: double
//!     function: sum
//!     args: [0]
//!     input: [fetch, fetch]
//!     log: logs/double          # false discards output, absent inherits it
//!     cluster: { queue: normal, memory: 4000 }
//! ```
//!
//! `args`, `requires` and `input` accept a single scalar or a list.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::Result;
use crate::DEFAULT_LOG_TARGET;
use crate::task::{ClusterConfig, Launcher, LogMode, Task};
use crate::value::{Kwargs, Value};

/// Contents of a definition file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub tasks: Vec<TaskDefinition>,
}

/// One task entry of a definition file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    pub name: String,

    /// Registry key
    pub function: String,

    #[serde(deserialize_with = "single_or_vec_value", default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Kwargs,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub requires: Vec<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub input: Vec<String>,

    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub log: Option<LogSetting>,

    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

/// `log:` entry: `false` discards, `true` inherits, a path is a file prefix.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum LogSetting {
    Enabled(bool),
    Prefix(PathBuf),
}

impl From<Option<LogSetting>> for LogMode {
    fn from(setting: Option<LogSetting>) -> Self {
        match setting {
            None | Some(LogSetting::Enabled(true)) => LogMode::Inherit,
            Some(LogSetting::Enabled(false)) => LogMode::Discard,
            Some(LogSetting::Prefix(prefix)) => LogMode::Files(prefix),
        }
    }
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::String(s) if s.is_empty() => Ok(Vec::new()),
        serde_json::Value::String(s) => Ok(vec![s]),
        serde_json::Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected task name in list")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected task name or list of task names")),
    }
}

/// A scalar or mapping is one argument; a sequence is the argument list.
fn single_or_vec_value<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Vec::new(),
        Value::List(items) => items,
        other => vec![other],
    })
}

impl TaskDefinition {
    /// Builds the task; `launcher` overrides the current executable.
    pub fn into_task(self, launcher: Option<&Launcher>) -> Task {
        let mut task = Task::new(self.function)
            .named(self.name)
            .with_args(self.args)
            .with_log(LogMode::from(self.log))
            .with_skip(self.skip);

        task.kwargs = self.kwargs;
        task.requires = self.requires;
        task.input = self.input;

        if let Some(config) = self.cluster {
            task = task.with_cluster(config);
        }
        if let Some(launcher) = launcher {
            task = task.with_launcher(launcher.clone());
        }

        task
    }
}

impl WorkflowDefinition {
    pub fn into_tasks(self, launcher: Option<&Launcher>) -> Vec<Task> {
        self.tasks
            .into_iter()
            .map(|definition| definition.into_task(launcher))
            .collect()
    }
}

/// Parses definition text.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_yaml::from_str(text)?;
    debug!(target: DEFAULT_LOG_TARGET, "Parsed {} task definitions", definition.tasks.len());
    Ok(definition)
}

/// Loads a definition file.
///
/// Relative log prefixes are resolved against the directory of the file.
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!(target: DEFAULT_LOG_TARGET, "Loading workflow from: {}", path.display());

    let mut definition = parse_definition(&fs::read_to_string(path)?)?;

    if let Some(base) = path.parent() {
        for task in &mut definition.tasks {
            if let Some(LogSetting::Prefix(prefix)) = &mut task.log {
                if prefix.is_relative() {
                    *prefix = base.join(&*prefix);
                }
            }
        }
    }

    info!(target: DEFAULT_LOG_TARGET, "Parsed {} tasks", definition.tasks.len());
    Ok(definition)
}
