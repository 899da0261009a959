//! Batch Execution
//!
//! A fixed set of independent tasks started together and awaited together.
//! Results are kept in the order the tasks were given, whatever order they
//! finish in.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::task::{Task, TaskStatus};
use crate::value::Value;
use crate::DEFAULT_LOG_TARGET;

/// Independent tasks run side by side.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use jobgraph::{Batch, Task};
///
/// let tasks = ["uniprot", "interpro", "pfam"]
///     .iter()
///     .map(|db| Task::new("shell").named(*db).with_arg(format!("refresh {}", db)))
///     .collect();
///
/// let mut batch = Batch::new(tasks);
/// batch.start().wait(Duration::from_secs(30));
/// assert!(batch.is_done());
/// ```
#[derive(Debug)]
pub struct Batch {
    tasks: Vec<Task>,
    results: Vec<Option<Value>>,
    collected: Vec<bool>,
    workdir: Option<PathBuf>,
    log_target: String,
}

impl Batch {
    pub fn new(tasks: Vec<Task>) -> Self {
        let count = tasks.len();
        Self {
            tasks,
            results: vec![None; count],
            collected: vec![false; count],
            workdir: None,
            log_target: DEFAULT_LOG_TARGET.to_string(),
        }
    }

    /// Directory for payload files; the system temp directory by default.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Registry served by the current executable, for tasks with neither a
    /// launcher nor a registry of their own.
    pub fn with_registry(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        for task in self.tasks.iter_mut().filter(|task| task.registry.is_none()) {
            task.registry = Some(name.clone());
        }
        self
    }

    /// Target of the batch records and of those of its tasks.
    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        for task in &mut self.tasks {
            task.log_target = self.log_target.clone();
        }
        self
    }

    /// Starts every task. A task that cannot be started is logged and counts
    /// as failed.
    pub fn start(&mut self) -> &mut Self {
        let target = self.log_target.as_str();

        if let Some(dir) = &self.workdir {
            if let Err(e) = fs::create_dir_all(dir) {
                error!(target: target, "cannot create {}: {}", dir.display(), e);
            }
        }

        for (i, task) in self.tasks.iter_mut().enumerate() {
            self.results[i] = None;
            self.collected[i] = false;

            match task.start(Vec::new(), self.workdir.as_deref()) {
                Ok(()) if task.status() != TaskStatus::Error => {
                    info!(target: target, "task '{}' is now running", task.label())
                }
                Ok(()) => error!(target: target, "task '{}' was not accepted by the cluster", task.label()),
                Err(e) => error!(target: target, "task '{}' could not start: {}", task.label(), e),
            }
        }

        self
    }

    /// Blocks until every task has terminated, polling every `interval`.
    ///
    /// Each task is collected exactly once, as soon as it is seen to have
    /// terminated.
    pub fn wait(&mut self, interval: Duration) -> &mut Self {
        loop {
            let mut pending = 0;

            for i in 0..self.tasks.len() {
                if self.collected[i] {
                    continue;
                }

                let task = &mut self.tasks[i];
                if !task.has_terminated() {
                    pending += 1;
                    continue;
                }

                self.results[i] = task.collect();
                self.collected[i] = true;

                if task.is_done() {
                    info!(target: self.log_target.as_str(), "task '{}' has terminated", task.label());
                } else {
                    error!(target: self.log_target.as_str(), "task '{}' has failed", task.label());
                }
            }

            if pending == 0 {
                return self;
            }

            thread::sleep(interval);
        }
    }

    /// True if every task succeeded.
    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(Task::is_done)
    }

    /// Stops every task that has not terminated yet.
    pub fn stop(&mut self) -> &mut Self {
        for (i, task) in self.tasks.iter_mut().enumerate() {
            if self.collected[i] || task.status().is_terminal() {
                continue;
            }

            if let Err(e) = task.stop() {
                error!(target: self.log_target.as_str(), "cannot stop task '{}': {}", task.label(), e);
            }
            self.collected[i] = true;
        }
        self
    }

    /// Results in task order; `None` for tasks that failed or are unfinished.
    pub fn results(&self) -> &[Option<Value>] {
        &self.results
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
