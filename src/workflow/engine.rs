//! Workflow Scheduler
//!
//! Runs a validated task graph against the run store:
//! 1. Plans which tasks to (re)activate
//! 2. Supersedes their active runs with pending ones
//! 3. Polls until no active run is pending or running, starting tasks whose
//!    dependencies succeeded and failing those whose dependencies failed
//!
//! Every tick works on one snapshot of the active runs taken at its start,
//! and writes its changes back in one transaction. A task started on a tick
//! is seen by its dependents on the next one, so failures cascade one level
//! per tick.

use std::collections::HashMap;
use std::fs;
use std::thread;
use std::time::Instant;

use log::{error, info, warn};

use crate::error::Result;
use crate::task::{Task, TaskStatus};
use crate::value::Value;

use super::config::{RunOptions, WorkflowConfig};
use super::planner::{self, Graph, Readiness};
use super::store::{ActiveRun, RunChange, RunRecord, Store};
use super::validator::validate_tasks;

/// Outcome of [`Workflow::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Tasks activated by the run, in dependency order
    pub planned: Vec<String>,
    /// Status of the active run of every task that has one
    pub statuses: Vec<(String, TaskStatus)>,
    /// False for a dry run
    pub processed: bool,
}

impl RunReport {
    pub fn status_of(&self, name: &str) -> Option<TaskStatus> {
        self.statuses
            .iter()
            .find(|(task, _)| task == name)
            .map(|(_, status)| *status)
    }

    /// True if the run was processed and every planned task succeeded.
    pub fn is_success(&self) -> bool {
        self.processed
            && self
                .planned
                .iter()
                .all(|name| self.status_of(name) == Some(TaskStatus::Success))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, status)| *status == TaskStatus::Error)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// A persisted graph of named tasks.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use jobgraph::workflow::{RunOptions, Workflow, WorkflowConfig};
/// use jobgraph::Task;
///
/// fn main() -> jobgraph::Result<()> {
///     let tasks = vec![
///         Task::new("shell").named("fetch").with_arg("curl -sO https://example.org/data.csv"),
///         Task::new("shell").named("load").with_arg("psql -f load.sql").depends_on("fetch"),
///     ];
///
///     let mut workflow = Workflow::new(tasks, WorkflowConfig::new("etl.sqlite"))?;
///     let report = workflow.run(RunOptions::all().with_poll_interval(Duration::from_secs(10)))?;
///     assert!(report.is_success());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Workflow {
    tasks: Vec<Task>,
    ids: Vec<i64>,
    graph: Graph,
    order: Vec<usize>,
    store: Store,
    config: WorkflowConfig,
}

impl Workflow {
    /// Validates the tasks, opens the store, and re-attaches to runs a
    /// previous scheduler left running.
    ///
    /// Runs whose execution already ended are finalized here; the others
    /// stay running and are polled by the next [`run`](Self::run).
    pub fn new(mut tasks: Vec<Task>, config: WorkflowConfig) -> Result<Self> {
        let order = validate_tasks(&tasks, &config.log_target)?;

        for task in &mut tasks {
            task.log_target = config.log_target.clone();
            if task.registry.is_none() {
                task.registry = Some(config.registry.clone());
            }
        }

        if let Some(dir) = &config.workdir {
            fs::create_dir_all(dir)?;
        }

        let mut store = Store::open_with_target(&config.database, &config.log_target)?;
        let names: Vec<&str> = tasks.iter().map(Task::label).collect();
        let ids = store.register_tasks(&names)?;
        let graph = Graph::build(&tasks);

        let mut workflow = Self {
            tasks,
            ids,
            graph,
            order,
            store,
            config,
        };
        workflow.recover()?;
        Ok(workflow)
    }

    fn recover(&mut self) -> Result<()> {
        let runs = self.snapshot()?;
        let target = self.config.log_target.clone();
        let mut changes = Vec::new();

        for &i in &self.order {
            let Some(run) = runs.get(&i).filter(|run| run.status == TaskStatus::Running) else {
                continue;
            };

            let task = &mut self.tasks[i];
            task.adopt(run.files(), run.job_id, run.pid);

            if task.has_terminated() {
                warn!(target: target.as_str(), "task '{}' ended while unobserved", task.label());
                finish(task, self.ids[i], &target, &mut changes);
            } else {
                info!(target: target.as_str(), "task '{}' is still running", task.label());
            }
        }

        self.store.record(&changes)
    }

    /// Plans and, unless it is a dry run, executes a run.
    ///
    /// Configuration problems are reported before the store is touched. A
    /// task that cannot be started is marked failed and the run goes on.
    pub fn run(&mut self, options: RunOptions) -> Result<RunReport> {
        let target = self.config.log_target.clone();
        let runs = self.snapshot()?;
        let planned = planner::plan(&self.graph, &self.order, &runs, &options, &target)?;
        let planned_names: Vec<String> = planned
            .iter()
            .map(|&i| self.graph.name(i).to_string())
            .collect();

        if !options.process {
            let mut names = planned_names.clone();
            names.sort();
            info!(target: target.as_str(), "tasks about to be processed: {}", names.join(", "));
            return Ok(RunReport {
                planned: planned_names,
                statuses: self.statuses_from(&runs),
                processed: false,
            });
        }

        let ids: Vec<i64> = planned.iter().map(|&i| self.ids[i]).collect();
        self.store.activate(&ids)?;
        for &i in &planned {
            self.tasks[i].reset();
        }

        info!(
            target: target.as_str(),
            "Starting run of {} tasks (poll interval: {:?})",
            planned.len(),
            options.poll_interval
        );

        let start_time = Instant::now();
        while self.tick(&options, &target)? {
            thread::sleep(options.poll_interval);
        }

        let report = RunReport {
            planned: planned_names,
            statuses: self.statuses_from(&self.snapshot()?),
            processed: true,
        };

        info!(
            target: target.as_str(),
            "Run finished in {:.2?} ({} failed)",
            start_time.elapsed(),
            report.failed().len()
        );
        Ok(report)
    }

    /// One scheduling pass. Returns true while some active run is still
    /// pending or running.
    fn tick(&mut self, options: &RunOptions, target: &str) -> Result<bool> {
        let runs = self.snapshot()?;
        let mut changes = Vec::new();
        let mut outstanding = 0;

        for idx in 0..self.order.len() {
            let i = self.order[idx];
            let Some(run) = runs.get(&i) else {
                continue;
            };

            match run.status {
                TaskStatus::Running => {
                    let task = &mut self.tasks[i];
                    if !task.is_attached() && !task.status().is_terminal() {
                        task.adopt(run.files(), run.job_id, run.pid);
                    }

                    if task.has_terminated() {
                        finish(task, self.ids[i], target, &mut changes);
                    } else {
                        outstanding += 1;
                    }
                }
                TaskStatus::Pending => match planner::evaluate(&self.graph, i, &runs, options.include_deps) {
                    Readiness::Deferred => outstanding += 1,
                    Readiness::Failed(dependency) => {
                        let task = &mut self.tasks[i];
                        task.fail();
                        error!(
                            target: target,
                            "task '{}' cannot run: dependency '{}' failed",
                            task.label(),
                            dependency
                        );
                        changes.push(RunChange::Finished {
                            task_id: self.ids[i],
                            status: TaskStatus::Error,
                            result: None,
                        });
                    }
                    Readiness::Ready(input) => {
                        if self.launch(i, input, target, &mut changes) {
                            outstanding += 1;
                        }
                    }
                },
                TaskStatus::Success | TaskStatus::Error => {}
            }
        }

        self.store.record(&changes)?;
        Ok(outstanding > 0)
    }

    /// Starts one task and queues the matching change. Returns true if the
    /// task is now in flight.
    fn launch(&mut self, i: usize, input: Vec<Value>, target: &str, changes: &mut Vec<RunChange>) -> bool {
        let task_id = self.ids[i];
        let task = &mut self.tasks[i];

        match task.start(input, self.config.workdir.as_deref()) {
            Ok(()) if task.status() != TaskStatus::Error => {
                info!(target: target, "task '{}' is now running", task.label());
                changes.push(RunChange::Started {
                    task_id,
                    files: task.files().cloned(),
                    job_id: task.job_id(),
                    pid: task.pid(),
                });
                true
            }
            Ok(()) => {
                error!(target: target, "task '{}' was not accepted by the cluster", task.label());
                changes.push(RunChange::Finished {
                    task_id,
                    status: TaskStatus::Error,
                    result: None,
                });
                false
            }
            Err(e) => {
                error!(target: target, "task '{}' could not start: {}", task.label(), e);
                changes.push(RunChange::Finished {
                    task_id,
                    status: TaskStatus::Error,
                    result: None,
                });
                false
            }
        }
    }

    /// Active runs keyed by task index.
    fn snapshot(&self) -> Result<HashMap<usize, ActiveRun>> {
        let mut by_id = self.store.active_runs()?;
        Ok(self
            .ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| by_id.remove(id).map(|run| (i, run)))
            .collect())
    }

    fn statuses_from(&self, runs: &HashMap<usize, ActiveRun>) -> Vec<(String, TaskStatus)> {
        self.order
            .iter()
            .filter_map(|&i| runs.get(&i).map(|run| (self.graph.name(i).to_string(), run.status)))
            .collect()
    }

    /// Status of the active run of every task, in dependency order; `None`
    /// for tasks that never ran.
    pub fn statuses(&self) -> Result<Vec<(String, Option<TaskStatus>)>> {
        let runs = self.snapshot()?;
        Ok(self
            .order
            .iter()
            .map(|&i| (self.graph.name(i).to_string(), runs.get(&i).map(|run| run.status)))
            .collect())
    }

    /// Every run of a task, oldest first.
    pub fn history(&self, name: &str) -> Result<Vec<RunRecord>> {
        self.store.history(name)
    }

    /// Tasks in dependency order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.order.iter().map(move |&i| &self.tasks[i])
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.graph.id(name).map(|i| &self.tasks[i])
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn finish(task: &mut Task, task_id: i64, target: &str, changes: &mut Vec<RunChange>) {
    let result = task.collect();

    if task.is_done() {
        info!(target: target, "task '{}' has terminated", task.label());
    } else {
        error!(target: target, "task '{}' has failed", task.label());
    }

    changes.push(RunChange::Finished {
        task_id,
        status: task.status(),
        result,
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    use crate::error::Error;
    use crate::task::{Launcher, LogMode, PayloadFiles};

    /// Task whose runner is a shell script; `$2` is the result file.
    fn script(name: &str, body: &str) -> Task {
        Task::new("script")
            .named(name)
            .with_launcher(Launcher::new("sh", "default").with_args(["-c", body, "sh"]))
            .with_log(LogMode::Discard)
    }

    fn config(dir: &Path) -> WorkflowConfig {
        WorkflowConfig::new(dir.join("runs.sqlite")).with_workdir(dir.join("work"))
    }

    fn fast() -> RunOptions {
        RunOptions::all().with_poll_interval(Duration::from_millis(20))
    }

    fn chain(dir: &TempDir, first: &str) -> Workflow {
        let tasks = vec![
            script("a", first),
            script("b", "printf 2 > \"$2\"").depends_on("a"),
            script("c", "printf 3 > \"$2\"").depends_on("b"),
        ];
        Workflow::new(tasks, config(dir.path())).unwrap()
    }

    #[test]
    fn test_chain_succeeds() {
        let dir = tempdir().unwrap();
        let mut workflow = chain(&dir, "printf 1 > \"$2\"");

        let report = workflow.run(fast()).unwrap();

        assert!(report.is_success());
        assert_eq!(report.planned, vec!["a", "b", "c"]);
        let history = workflow.history("c").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result, Some(Value::Int(3)));
        assert!(history[0].start_time.is_some());
    }

    #[test]
    fn test_failure_cascades_without_running() {
        let dir = tempdir().unwrap();
        let mut workflow = chain(&dir, "exit 1");

        let report = workflow.run(fast()).unwrap();

        assert!(!report.is_success());
        assert_eq!(report.failed(), vec!["a", "b", "c"]);
        for name in ["b", "c"] {
            let run = &workflow.history(name).unwrap()[0];
            assert_eq!(run.status, TaskStatus::Error);
            assert!(run.start_time.is_none());
        }
        assert_eq!(workflow.history("a").unwrap()[0].result, Some(Value::Null));
    }

    #[test]
    fn test_payload_files_are_removed() {
        let dir = tempdir().unwrap();
        let mut workflow = chain(&dir, "printf 1 > \"$2\"");
        workflow.run(fast()).unwrap();

        assert_eq!(fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut workflow = chain(&dir, "printf 1 > \"$2\"");

        let report = workflow.run(fast().dry_run()).unwrap();

        assert!(!report.processed);
        assert_eq!(report.planned, vec!["a", "b", "c"]);
        assert!(workflow.store().latest().unwrap().is_empty());
        assert_eq!(workflow.statuses().unwrap()[0], ("a".to_string(), None));
    }

    #[test]
    fn test_unstartable_task_fails_and_run_continues() {
        let dir = tempdir().unwrap();
        let broken = Task::new("echo")
            .named("broken")
            .with_launcher(Launcher::new("/nonexistent/runner", "default"));
        let tasks = vec![broken, script("fine", "printf 1 > \"$2\"")];
        let mut workflow = Workflow::new(tasks, config(dir.path())).unwrap();

        let report = workflow.run(fast()).unwrap();

        assert_eq!(report.status_of("broken"), Some(TaskStatus::Error));
        assert_eq!(report.status_of("fine"), Some(TaskStatus::Success));
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let dir = tempdir().unwrap();
        let tasks = vec![script("a", "true").depends_on("a")];
        let err = Workflow::new(tasks, config(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(!dir.path().join("runs.sqlite").exists());
    }

    #[test]
    fn test_dead_run_is_finalized_on_construction() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let files = PayloadFiles {
            infile: work.join("a.in"),
            outfile: work.join("a.out"),
        };
        fs::write(&files.outfile, "\"done\"").unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        {
            let mut store = Store::open(dir.path().join("runs.sqlite")).unwrap();
            let ids = store.register_tasks(&["a"]).unwrap();
            store.activate(&ids).unwrap();
            store
                .record(&[RunChange::Started {
                    task_id: ids[0],
                    files: Some(files.clone()),
                    job_id: None,
                    pid: Some(pid),
                }])
                .unwrap();
        }

        let workflow = Workflow::new(vec![script("a", "true")], config(dir.path())).unwrap();

        let run = &workflow.history("a").unwrap()[0];
        assert_eq!(run.status, TaskStatus::Success);
        assert_eq!(run.result, Some(Value::from("done")));
        assert!(!files.outfile.exists());
    }

    /// Records a running pid for task "a" in a fresh store.
    fn seed_running(dir: &Path, files: Option<PayloadFiles>, pid: u32) {
        let mut store = Store::open(dir.join("runs.sqlite")).unwrap();
        let ids = store.register_tasks(&["a"]).unwrap();
        store.activate(&ids).unwrap();
        store
            .record(&[RunChange::Started {
                task_id: ids[0],
                files,
                job_id: None,
                pid: Some(pid),
            }])
            .unwrap();
    }

    fn payload_files(dir: &Path) -> PayloadFiles {
        let work = dir.join("work");
        fs::create_dir_all(&work).unwrap();
        PayloadFiles {
            infile: work.join("a.in"),
            outfile: work.join("a.out"),
        }
    }

    #[test]
    fn test_live_run_blocks_new_activation() {
        let dir = tempdir().unwrap();
        let files = payload_files(dir.path());
        let mut runner = std::process::Command::new("sh")
            .args(["-c", "sleep 30; true", "sh"])
            .arg(&files.infile)
            .arg(&files.outfile)
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !crate::execution::local::runner_alive(runner.id(), &files.infile) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }

        seed_running(dir.path(), Some(files), runner.id());

        let mut workflow = Workflow::new(vec![script("a", "true")], config(dir.path())).unwrap();
        assert_eq!(workflow.statuses().unwrap()[0].1, Some(TaskStatus::Running));
        let err = workflow.run(fast()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));

        runner.kill().unwrap();
        runner.wait().unwrap();
    }

    #[test]
    fn test_recycled_pid_is_not_adopted() {
        let dir = tempdir().unwrap();
        let files = payload_files(dir.path());
        let mut stranger = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        seed_running(dir.path(), Some(files), stranger.id());

        let workflow = Workflow::new(vec![script("a", "true")], config(dir.path())).unwrap();
        let run = &workflow.history("a").unwrap()[0];
        assert_eq!(run.status, TaskStatus::Error);

        assert!(stranger.try_wait().unwrap().is_none());
        stranger.kill().unwrap();
        stranger.wait().unwrap();
    }

    #[test]
    fn test_config_registry_and_target_reach_tasks() {
        let dir = tempdir().unwrap();
        let tasks = vec![
            Task::new("echo").named("plain"),
            Task::new("echo").named("own").with_registry("reports"),
            script("scripted", "true"),
        ];
        let config = config(dir.path())
            .with_registry("etl")
            .with_log_target("jobgraph::etl");

        let workflow = Workflow::new(tasks, config).unwrap();

        assert_eq!(workflow.task("plain").unwrap().registry(), "etl");
        assert_eq!(workflow.task("own").unwrap().registry(), "reports");
        assert_eq!(workflow.task("scripted").unwrap().registry(), "default");
        assert!(workflow.tasks().all(|task| task.log_target() == "jobgraph::etl"));
    }

    #[test]
    fn test_cluster_tasks_pass_results_along() {
        use crate::execution::cluster::fake;

        let dir = tempdir().unwrap();
        let state = dir.path().join("cluster");
        fs::create_dir_all(&state).unwrap();
        let cluster = fake::cluster(&state);

        let on_cluster = |task: Task| task.with_cluster(cluster.clone());
        let tasks = vec![
            on_cluster(script("a", "printf 4 > \"$2\"")),
            on_cluster(script("b", "printf 5 > \"$2\"")).takes_input_from("a"),
        ];
        let mut workflow = Workflow::new(tasks, config(dir.path())).unwrap();

        let report = workflow.run(fast()).unwrap();

        assert!(report.is_success());
        for (name, value) in [("a", 4), ("b", 5)] {
            let run = &workflow.history(name).unwrap()[0];
            assert_eq!(run.result, Some(Value::Int(value)));
            assert!(run.job_id.is_some());
        }
        assert_eq!(fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }
}
