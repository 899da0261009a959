//! Workflow Validation
//!
//! Checks a set of tasks before anything touches the store:
//! - Every task has a non-empty, unique name
//! - Every task names a function
//! - Every dependency resolves, and none points back at its own task
//! - The dependency graph has no cycle
//!
//! On success the tasks' topological order is returned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::task::Task;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    MissingName(usize),
    EmptyName,
    DuplicateName(String),
    EmptyFunction(String),
    UnknownDependency { task: String, dependency: String },
    SelfDependency(String),
    CyclicDependency(Vec<String>),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no tasks"),
            Self::MissingName(position) => write!(f, "Task #{} has no name", position + 1),
            Self::EmptyName => write!(f, "Task has an empty or whitespace-only name"),
            Self::DuplicateName(name) => write!(f, "Duplicate task name: '{}'", name),
            Self::EmptyFunction(name) => write!(f, "Task '{}' has no function specified", name),
            Self::UnknownDependency { task, dependency } => {
                write!(f, "Task '{}' depends on unknown task '{}'", task, dependency)
            }
            Self::SelfDependency(name) => write!(f, "Task '{}' depends on itself", name),
            Self::CyclicDependency(names) => {
                write!(f, "Tasks depend on each other in a loop: {}", names.join(", "))
            }
        }
    }
}

/// Validates a single task's fields.
fn validate_task(position: usize, task: &Task, target: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let Some(name) = task.name.as_deref() else {
        errors.push(ValidationError::MissingName(position));
        return errors;
    };

    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
        return errors;
    }

    if task.function.trim().is_empty() {
        errors.push(ValidationError::EmptyFunction(name.to_string()));
    }

    if task.dependencies().contains(&name) {
        errors.push(ValidationError::SelfDependency(name.to_string()));
    }

    if task.requires.is_empty() && task.input.is_empty() {
        debug!(target: target, "Task '{}' is a root task (no dependencies)", name);
    }

    errors
}

/// Validates the whole task set and returns the task indices in dependency
/// order.
///
/// Every problem found is reported at once in [`Error::Invalid`]. Records
/// are logged under `target`.
pub fn validate_tasks(tasks: &[Task], target: &str) -> Result<Vec<usize>> {
    info!(target: target, "Validating workflow with {} tasks", tasks.len());

    if tasks.is_empty() {
        return Err(Error::Invalid(vec![ValidationError::EmptyWorkflow]));
    }

    let mut errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for (position, task) in tasks.iter().enumerate() {
        errors.extend(validate_task(position, task, target));

        if let Some(name) = task.name.as_deref() {
            if !name.trim().is_empty() && !seen.insert(name) {
                errors.push(ValidationError::DuplicateName(name.to_string()));
            }
        }
    }

    for task in tasks {
        let Some(name) = task.name.as_deref() else {
            continue;
        };

        for dependency in task.dependencies() {
            if dependency != name && !seen.contains(dependency) {
                errors.push(ValidationError::UnknownDependency {
                    task: name.to_string(),
                    dependency: dependency.to_string(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return Err(Error::Invalid(errors));
    }

    let order = topological_sort(tasks, target)?;

    info!(target: target, "Workflow validated: {} tasks", tasks.len());
    Ok(order)
}

/// Orders task indices so that dependencies come before dependents, using
/// Kahn's algorithm. Tasks left over once no root remains form a cycle.
fn topological_sort(tasks: &[Task], target: &str) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .filter_map(|(i, task)| task.name.as_deref().map(|name| (name, i)))
        .collect();

    let mut in_degree = vec![0usize; tasks.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];

    for (i, task) in tasks.iter().enumerate() {
        let dependencies: HashSet<usize> = task
            .dependencies()
            .into_iter()
            .filter_map(|name| index.get(name).copied())
            .collect();

        in_degree[i] = dependencies.len();
        for dependency in dependencies {
            successors[dependency].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted_order = Vec::with_capacity(tasks.len());

    while let Some(current) = queue.pop_front() {
        sorted_order.push(current);

        for &successor in &successors[current] {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                queue.push_back(successor);
            }
        }
    }

    if sorted_order.len() != tasks.len() {
        let mut stuck: Vec<String> = (0..tasks.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| tasks[i].label().to_string())
            .collect();
        stuck.sort();
        return Err(Error::Invalid(vec![ValidationError::CyclicDependency(stuck)]));
    }

    debug!(
        target: target,
        "Topological order: {:?}",
        sorted_order.iter().map(|&i| tasks[i].label()).collect::<Vec<_>>()
    );

    Ok(sorted_order)
}
