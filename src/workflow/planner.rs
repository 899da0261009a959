//! Execution Planner
//!
//! Decides which tasks a run (re)activates, and whether a pending task may
//! start on the current tick.
//!
//! Both work on task indices and a snapshot of the active runs keyed by the
//! same indices; the store is never queried from here.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::task::{Task, TaskStatus};
use crate::value::Value;

use super::config::RunOptions;
use super::store::ActiveRun;

/// Dependency edges of a validated task set, by index.
#[derive(Debug, Clone)]
pub struct Graph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    requires: Vec<Vec<usize>>,
    input: Vec<Vec<usize>>,
    skip: Vec<bool>,
}

impl Graph {
    /// Builds the graph of validated tasks. Names that do not resolve are
    /// ignored.
    pub fn build(tasks: &[Task]) -> Self {
        let names: Vec<String> = tasks.iter().map(|t| t.label().to_string()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let resolve = |deps: &[String]| -> Vec<usize> {
            deps.iter().filter_map(|name| index.get(name).copied()).collect()
        };

        let requires = tasks.iter().map(|t| resolve(&t.requires)).collect();
        let input = tasks.iter().map(|t| resolve(&t.input)).collect();
        let skip = tasks.iter().map(|t| t.skip).collect();

        Self {
            names,
            index,
            requires,
            input,
            skip,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, task: usize) -> &str {
        &self.names[task]
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Dependencies that gate the start of `task`: `requires` then `input`,
    /// or only `input` when dependencies are not followed.
    pub fn considered(&self, task: usize, include_deps: bool) -> Vec<usize> {
        if include_deps {
            self.requires[task]
                .iter()
                .chain(self.input[task].iter())
                .copied()
                .collect()
        } else {
            self.input[task].clone()
        }
    }

    /// Tasks whose results become leading arguments of `task`, in order.
    pub fn inputs(&self, task: usize) -> &[usize] {
        &self.input[task]
    }
}

/// Outcome of evaluating a pending task on one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// A dependency has no active run yet, or has not finished
    Deferred,
    /// The named dependency failed; the task fails without running
    Failed(String),
    /// Every dependency succeeded; the input results to prepend
    Ready(Vec<Value>),
}

/// Computes the tasks to (re)activate, in the order of `order`.
///
/// Fails without side effects when a named task is unknown, when a planned
/// task is still running, or when a planned task depends on a task that has
/// neither an active run nor a place in the plan.
pub fn plan(
    graph: &Graph,
    order: &[usize],
    runs: &HashMap<usize, ActiveRun>,
    options: &RunOptions,
    target: &str,
) -> Result<Vec<usize>> {
    let status = |task: usize| runs.get(&task).map(|run| run.status);
    let mut selected: BTreeSet<usize> = BTreeSet::new();

    if options.tasks.is_empty() {
        selected.extend((0..graph.len()).filter(|&i| !graph.skip[i]));
    } else {
        let mut unknown = Vec::new();
        let mut stack = Vec::new();

        for name in &options.tasks {
            match graph.id(name) {
                Some(task) if status(task) == Some(TaskStatus::Success) && !options.rerun => {
                    info!(target: target, "Task '{}' already completed; use rerun to run it again", name);
                }
                Some(task) => stack.push(task),
                None => unknown.push(name.clone()),
            }
        }

        if !unknown.is_empty() {
            return Err(Error::UnknownTasks(unknown));
        }

        while let Some(task) = stack.pop() {
            if !selected.insert(task) || !options.include_deps {
                continue;
            }

            for dependency in graph.considered(task, true) {
                if options.rerun || status(dependency) != Some(TaskStatus::Success) {
                    stack.push(dependency);
                }
            }
        }
    }

    let running: Vec<String> = selected
        .iter()
        .filter(|&&task| status(task) == Some(TaskStatus::Running))
        .map(|&task| graph.name(task).to_string())
        .collect();

    if !running.is_empty() {
        return Err(Error::AlreadyRunning(running));
    }

    for &task in &selected {
        for dependency in graph.considered(task, options.include_deps) {
            if !selected.contains(&dependency) && !runs.contains_key(&dependency) {
                return Err(Error::MissingDependencyRun {
                    task: graph.name(task).to_string(),
                    dependency: graph.name(dependency).to_string(),
                });
            }
        }
    }

    let planned: Vec<usize> = order.iter().copied().filter(|i| selected.contains(i)).collect();
    debug!(
        target: target,
        "Planned tasks: {:?}",
        planned.iter().map(|&i| graph.name(i)).collect::<Vec<_>>()
    );
    Ok(planned)
}

/// Decides whether a pending task may start, given the active runs at the
/// beginning of the tick.
///
/// A dependency without an active run defers the task, even if another
/// dependency failed; a failed dependency fails it; an unfinished one defers
/// it.
pub fn evaluate(
    graph: &Graph,
    task: usize,
    runs: &HashMap<usize, ActiveRun>,
    include_deps: bool,
) -> Readiness {
    let mut failed = None;
    let mut waiting = false;

    for dependency in graph.considered(task, include_deps) {
        match runs.get(&dependency).map(|run| run.status) {
            None => return Readiness::Deferred,
            Some(TaskStatus::Error) => {
                failed.get_or_insert(dependency);
            }
            Some(TaskStatus::Success) => {}
            Some(_) => waiting = true,
        }
    }

    if let Some(dependency) = failed {
        return Readiness::Failed(graph.name(dependency).to_string());
    }

    if waiting {
        return Readiness::Deferred;
    }

    let input = graph
        .inputs(task)
        .iter()
        .map(|dependency| {
            runs.get(dependency)
                .and_then(|run| run.result.clone())
                .unwrap_or(Value::Null)
        })
        .collect();

    Readiness::Ready(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn graph() -> Graph {
        // a ─► b ─► c,  a ═► d (input),  e (skip)
        Graph::build(&[
            Task::new("echo").named("a"),
            Task::new("echo").named("b").depends_on("a"),
            Task::new("echo").named("c").depends_on("b"),
            Task::new("echo").named("d").takes_input_from("a").with_arg(1),
            Task::new("echo").named("e").with_skip(true),
        ])
    }

    const ORDER: [usize; 5] = [0, 1, 2, 3, 4];
    const TARGET: &str = "jobgraph::planner";

    fn run(status: TaskStatus, result: Option<Value>) -> ActiveRun {
        ActiveRun {
            status,
            result,
            ..ActiveRun::default()
        }
    }

    fn runs(entries: &[(usize, TaskStatus)]) -> HashMap<usize, ActiveRun> {
        entries.iter().map(|&(i, status)| (i, run(status, None))).collect()
    }

    fn opts(names: &[&str]) -> RunOptions {
        RunOptions::for_tasks(names.iter().copied()).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_run_all_excludes_skipped() {
        let planned = plan(&graph(), &ORDER, &HashMap::new(), &RunOptions::all(), TARGET).unwrap();
        assert_eq!(planned, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_named_task_pulls_unfinished_dependencies() {
        let planned = plan(&graph(), &ORDER, &HashMap::new(), &opts(&["c"]), TARGET).unwrap();
        assert_eq!(planned, vec![0, 1, 2]);
    }

    #[test]
    fn test_successful_dependencies_stop_expansion() {
        let active = runs(&[(0, TaskStatus::Success), (1, TaskStatus::Success)]);
        let planned = plan(&graph(), &ORDER, &active, &opts(&["c"]), TARGET).unwrap();
        assert_eq!(planned, vec![2]);
    }

    #[test]
    fn test_rerun_includes_successful_dependencies() {
        let active = runs(&[(0, TaskStatus::Success), (1, TaskStatus::Success)]);
        let planned = plan(&graph(), &ORDER, &active, &opts(&["c"]).with_rerun(true), TARGET).unwrap();
        assert_eq!(planned, vec![0, 1, 2]);
    }

    #[test]
    fn test_successful_named_task_is_not_reactivated() {
        let active = runs(&[(0, TaskStatus::Success)]);
        let planned = plan(&graph(), &ORDER, &active, &opts(&["a"]), TARGET).unwrap();
        assert!(planned.is_empty());
    }

    #[test]
    fn test_unknown_names() {
        let err = plan(&graph(), &ORDER, &HashMap::new(), &opts(&["a", "zzz"]), TARGET).unwrap_err();
        assert!(matches!(err, Error::UnknownTasks(names) if names == vec!["zzz".to_string()]));
    }

    #[test]
    fn test_running_task_cannot_be_planned() {
        let active = runs(&[(0, TaskStatus::Running)]);
        let err = plan(&graph(), &ORDER, &active, &opts(&["b"]).with_rerun(true), TARGET).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(names) if names == vec!["a".to_string()]));

        let err = plan(&graph(), &ORDER, &active, &RunOptions::all(), TARGET).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
    }

    #[test]
    fn test_dependency_without_run_is_rejected() {
        let err = plan(&graph(), &ORDER, &HashMap::new(), &opts(&["d"]).without_dependencies(), TARGET)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingDependencyRun { ref task, ref dependency } if task == "d" && dependency == "a"
        ));
    }

    #[test]
    fn test_without_dependencies_ignores_requires() {
        let planned = plan(&graph(), &ORDER, &HashMap::new(), &opts(&["b"]).without_dependencies(), TARGET)
            .unwrap();
        assert_eq!(planned, vec![1]);
    }

    #[test]
    fn test_evaluate_states() {
        let g = graph();

        assert_eq!(evaluate(&g, 1, &HashMap::new(), true), Readiness::Deferred);
        assert_eq!(evaluate(&g, 1, &runs(&[(0, TaskStatus::Pending)]), true), Readiness::Deferred);
        assert_eq!(evaluate(&g, 1, &runs(&[(0, TaskStatus::Running)]), true), Readiness::Deferred);
        assert_eq!(
            evaluate(&g, 1, &runs(&[(0, TaskStatus::Error)]), true),
            Readiness::Failed("a".to_string())
        );
        assert_eq!(
            evaluate(&g, 1, &runs(&[(0, TaskStatus::Success)]), true),
            Readiness::Ready(Vec::new())
        );
        assert_eq!(evaluate(&g, 0, &HashMap::new(), true), Readiness::Ready(Vec::new()));
    }

    #[test]
    fn test_evaluate_passes_input_results() {
        let g = graph();
        let mut active = HashMap::new();
        active.insert(0, run(TaskStatus::Success, Some(Value::Int(5))));

        assert_eq!(evaluate(&g, 3, &active, true), Readiness::Ready(vec![Value::Int(5)]));

        active.insert(0, run(TaskStatus::Success, None));
        assert_eq!(evaluate(&g, 3, &active, true), Readiness::Ready(vec![Value::Null]));
    }

    #[test]
    fn test_evaluate_without_dependencies_ignores_requires() {
        let g = graph();
        assert_eq!(evaluate(&g, 1, &HashMap::new(), false), Readiness::Ready(Vec::new()));
    }
}
