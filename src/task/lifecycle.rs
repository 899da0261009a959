//! Task Lifecycle
//!
//! Drives one execution of a [`Task`]: pack the payload, start it on its
//! backend, poll it, collect the result, and remove the payload files.
//!
//! ```text
//! start ──► Pending ──► Running ──► Success
//!              │           │
//!              └───────────┴──────► Error   (also: stop, submission failure)
//! ```

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::error::Result;
use crate::execution::payload::{Call, Payload};
use crate::execution::{cluster, local};
use crate::value::Value;

use super::model::{Backend, ClusterConfig, Handle, Launcher, PayloadFiles, Task, TaskStatus};

/// Commands used for jobs adopted by a task that is no longer configured
/// for the cluster.
static DEFAULT_CLUSTER: Lazy<ClusterConfig> = Lazy::new(ClusterConfig::default);

fn cluster_config(backend: &Backend) -> &ClusterConfig {
    match backend {
        Backend::Cluster(config) => config,
        Backend::Local => &DEFAULT_CLUSTER,
    }
}

impl Task {
    /// Writes the payload file for one execution.
    ///
    /// `input_args` are placed before the task's own arguments. Any files of
    /// a previous execution are removed first.
    pub fn pack(&mut self, input_args: Vec<Value>, workdir: Option<&Path>) -> Result<()> {
        let launcher = self.resolve_launcher()?;
        self.pack_for(&launcher, input_args, workdir)
    }

    fn pack_for(
        &mut self,
        launcher: &Launcher,
        input_args: Vec<Value>,
        workdir: Option<&Path>,
    ) -> Result<()> {
        self.clean();

        let dir = workdir.map(Path::to_path_buf).unwrap_or_else(env::temp_dir);
        let (_, infile) = tempfile::Builder::new()
            .prefix("jobgraph-")
            .suffix(".in")
            .tempfile_in(&dir)?
            .keep()
            .map_err(|e| e.error)?;
        let outfile = infile.with_extension("out");

        let mut args = input_args;
        args.extend(self.args.iter().cloned());
        let call = Call {
            args,
            kwargs: self.kwargs.clone(),
        };

        let files = PayloadFiles { infile, outfile };
        if let Err(e) = Payload::new(&launcher.registry, &self.function, call).write_to(&files.infile) {
            remove_quietly(&files.infile, &self.log_target);
            return Err(e);
        }

        debug!(target: self.log_target.as_str(), "Packed '{}' into {}", self.label(), files.infile.display());
        self.files = Some(files);
        Ok(())
    }

    /// Packs the task and hands it to its backend.
    ///
    /// A local task is `Pending` until its first poll. A cluster task is
    /// `Running` once submitted, or `Error` if the submission response had no
    /// job id. Failing to spawn or submit at all returns an error and leaves
    /// the task in `Error`.
    pub fn start(&mut self, input_args: Vec<Value>, workdir: Option<&Path>) -> Result<()> {
        self.reset();

        let launcher = match self.resolve_launcher() {
            Ok(launcher) => launcher,
            Err(e) => {
                self.status = TaskStatus::Error;
                return Err(e);
            }
        };

        if let Err(e) = self.pack_for(&launcher, input_args, workdir) {
            self.status = TaskStatus::Error;
            return Err(e);
        }

        let command = match &self.files {
            Some(files) => launcher.command(&files.infile, &files.outfile),
            None => return Ok(()),
        };

        match self.backend.clone() {
            Backend::Local => match local::spawn(&command, &self.log, &self.log_target) {
                Ok(child) => {
                    debug!(target: self.log_target.as_str(), "Started '{}' as process {}", self.label(), child.id());
                    self.handle = Some(Handle::Local(child));
                    self.status = TaskStatus::Pending;
                    Ok(())
                }
                Err(e) => self.fail_start(e),
            },
            Backend::Cluster(config) => {
                let args = cluster::submission_args(&config, self.name.as_deref(), &self.log, &command);
                match cluster::submit(&args, &self.log_target) {
                    Ok(Some(job_id)) => {
                        debug!(target: self.log_target.as_str(), "Submitted '{}' as job {}", self.label(), job_id);
                        self.handle = Some(Handle::Cluster(job_id));
                        self.status = TaskStatus::Running;
                        Ok(())
                    }
                    Ok(None) => {
                        self.status = TaskStatus::Error;
                        self.clean();
                        Ok(())
                    }
                    Err(e) => self.fail_start(e),
                }
            }
        }
    }

    fn fail_start(&mut self, e: io::Error) -> Result<()> {
        self.status = TaskStatus::Error;
        self.clean();
        Err(e.into())
    }

    /// Kills the process or cancels the job. The task ends in `Error` and its
    /// payload files are removed.
    pub fn stop(&mut self) -> Result<()> {
        let outcome = match self.handle.as_mut() {
            Some(Handle::Local(child)) => local::kill(child),
            Some(Handle::Adopted(pid)) => {
                let killed = self
                    .files
                    .as_ref()
                    .map_or(false, |files| local::kill_runner(*pid, &files.infile));
                if !killed {
                    debug!(target: self.log_target.as_str(), "Process {} was already gone", pid);
                }
                Ok(())
            }
            Some(Handle::Cluster(job_id)) => {
                cluster::cancel(cluster_config(&self.backend), *job_id, &self.log_target)
            }
            None => Ok(()),
        };

        self.handle = None;
        self.status = TaskStatus::Error;
        self.clean();
        outcome.map_err(Into::into)
    }

    /// Polls the backend unless the status is already final.
    pub fn has_terminated(&mut self) -> bool {
        if !self.status.is_terminal() {
            self.status = self.poll();
        }
        self.status.is_terminal()
    }

    /// True once the task finished successfully.
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Success
    }

    fn poll(&mut self) -> TaskStatus {
        match self.handle.as_mut() {
            Some(Handle::Local(child)) => local::poll(child, &self.log_target),
            Some(Handle::Adopted(pid)) => match &self.files {
                Some(files) if local::runner_alive(*pid, &files.infile) => TaskStatus::Running,
                Some(files) if files.outfile.exists() => TaskStatus::Success,
                _ => TaskStatus::Error,
            },
            Some(Handle::Cluster(job_id)) => {
                cluster::query(cluster_config(&self.backend), *job_id, &self.log_target)
            }
            None => self.status,
        }
    }

    /// Reads the result of the finished execution and removes the payload
    /// files.
    ///
    /// Returns `None` when the runner wrote no result, which is the case for
    /// every failed execution. The result is cached, so later calls return it
    /// without touching the filesystem.
    pub fn collect(&mut self) -> Option<Value> {
        self.handle = None;

        if self.output.is_none() {
            if let Some(files) = &self.files {
                self.output = read_output(&files.outfile, &self.log_target);
            }
        }

        self.clean();
        self.output.clone()
    }

    /// Removes the payload files, once.
    pub fn clean(&mut self) {
        if let Some(files) = self.files.take() {
            let mut partial = files.outfile.clone().into_os_string();
            partial.push(".part");

            remove_quietly(&files.infile, &self.log_target);
            remove_quietly(&files.outfile, &self.log_target);
            remove_quietly(&PathBuf::from(partial), &self.log_target);
        }
    }

    /// Re-attaches the task to an execution started by an earlier scheduler.
    ///
    /// A job id resumes cluster polling. A pid is tracked while that process
    /// is still the runner of the payload file; once it is not, success is
    /// decided by the presence of the result file. With neither the
    /// execution cannot be observed and the task is `Error`.
    pub fn adopt(&mut self, files: Option<PayloadFiles>, job_id: Option<u64>, pid: Option<u32>) {
        self.reset();
        self.files = files;
        self.handle = match (job_id, pid) {
            (Some(job_id), _) => Some(Handle::Cluster(job_id)),
            (None, Some(pid)) => Some(Handle::Adopted(pid)),
            (None, None) => None,
        };
        self.status = if self.handle.is_some() {
            TaskStatus::Running
        } else {
            TaskStatus::Error
        };
    }

    /// Forgets the current execution.
    pub(crate) fn reset(&mut self) {
        self.clean();
        self.handle = None;
        self.output = None;
        self.status = TaskStatus::Pending;
    }

    /// Marks a task as failed without running it.
    pub(crate) fn fail(&mut self) {
        self.reset();
        self.status = TaskStatus::Error;
    }

    fn resolve_launcher(&self) -> Result<Launcher> {
        match &self.launcher {
            Some(launcher) => Ok(launcher.clone()),
            None => Ok(Launcher::current_exe(self.registry())?),
        }
    }
}

fn read_output(outfile: &Path, target: &str) -> Option<Value> {
    match fs::read(outfile) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: target, "Cannot decode result {}: {}", outfile.display(), e);
                None
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(target: target, "Cannot read result {}: {}", outfile.display(), e);
            None
        }
    }
}

fn remove_quietly(path: &Path, target: &str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: target, "Cannot remove {}: {}", path.display(), e),
    }
}
