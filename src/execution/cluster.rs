//! Batch-Cluster Backend
//!
//! Submits runners through an LSF-style command set: `bsub` to submit,
//! `bjobs` to query, `bkill` to cancel. The scheduler never receives
//! notifications from the cluster; it polls.
//!
//! Submission response:
//!
//! ```text
//! Job <4212> is submitted to queue <production>.
//! ```
//!
//! Status response (third field of the second line):
//!
//! ```text
//! JOBID   USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME
//! 4212    etl     RUN   production node001     node042     proteins   Oct 16 04:12
//! ```

use std::ffi::OsString;
use std::io;
use std::process::{Command, Stdio};

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::task::{ClusterConfig, LogMode, TaskStatus};

static JOB_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Job <(\d+)> is submitted").expect("job id pattern is a valid regex")
});

/// Builds the full submission command line, submission program first.
///
/// `job_name` is used when the configuration does not name the job, and
/// `command` is the runner invocation the job executes.
pub fn submission_args(
    config: &ClusterConfig,
    job_name: Option<&str>,
    log: &LogMode,
    command: &[OsString],
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![config.submit_command.clone().into()];

    if let Some(queue) = &config.queue {
        push_option(&mut args, "-q", queue);
    }

    if let Some(name) = config.job_name.as_deref().or(job_name) {
        push_option(&mut args, "-J", name);
    }

    if let Some(cpu) = config.cpu {
        push_option(&mut args, "-n", cpu.to_string());
    }

    push_option(&mut args, "-R", format!("rusage[mem={}]", config.memory));
    push_option(&mut args, "-M", config.memory.to_string());

    if let Some(tmp) = config.tmp {
        push_option(&mut args, "-R", format!("rusage[tmp={}]", tmp));
    }

    match log {
        LogMode::Inherit => {}
        LogMode::Discard => {
            push_option(&mut args, "-o", "/dev/null");
            push_option(&mut args, "-e", "/dev/null");
        }
        LogMode::Files(_) => {
            if let Some((out, err)) = log.paths() {
                push_option(&mut args, "-o", out);
                push_option(&mut args, "-e", err);
            }
        }
    }

    args.extend(command.iter().cloned());
    args
}

fn push_option(args: &mut Vec<OsString>, flag: &str, value: impl Into<OsString>) {
    args.push(flag.into());
    args.push(value.into());
}

/// Extracts the job id from a submission response.
pub fn parse_job_id(output: &str) -> Option<u64> {
    JOB_ID
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Maps a status response onto a [`TaskStatus`]. Anything unexpected,
/// including an empty response, is an error.
pub fn parse_job_status(output: &str) -> TaskStatus {
    let token = output
        .trim()
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().nth(2));

    match token {
        Some("PEND") => TaskStatus::Pending,
        Some("RUN") => TaskStatus::Running,
        Some("DONE") => TaskStatus::Success,
        _ => TaskStatus::Error,
    }
}

/// Runs a submission command line and returns the job id, if the response
/// contained one.
pub fn submit(args: &[OsString], target: &str) -> io::Result<Option<u64>> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty submission command"))?;

    let output = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let job_id = parse_job_id(&stdout);

    if job_id.is_none() {
        warn!(target: target, "Cannot find a job id in submission response: {:?}", stdout.trim());
    }

    Ok(job_id)
}

/// Queries the status of a job.
pub fn query(config: &ClusterConfig, job_id: u64, target: &str) -> TaskStatus {
    let output = Command::new(&config.status_command)
        .arg(job_id.to_string())
        .stdin(Stdio::null())
        .output();

    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let status = parse_job_status(&stdout);
            debug!(target: target, "Job {} is {} ({:?})", job_id, status, stdout.trim());
            status
        }
        Err(e) => {
            warn!(target: target, "Cannot query job {}: {}", job_id, e);
            TaskStatus::Error
        }
    }
}

/// Requests cancellation of a job.
pub fn cancel(config: &ClusterConfig, job_id: u64, target: &str) -> io::Result<()> {
    let output = Command::new(&config.cancel_command)
        .arg(job_id.to_string())
        .stdin(Stdio::null())
        .output()?;

    debug!(
        target: target,
        "{} {}: {}",
        config.cancel_command,
        job_id,
        String::from_utf8_lossy(&output.stdout).trim()
    );
    Ok(())
}

/// Wrapper scripts standing in for the cluster commands in tests.
#[cfg(all(test, unix))]
pub(crate) mod fake {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use crate::task::ClusterConfig;

    /// Commands keeping their state in `dir`:
    /// - `bsub` runs the job to completion on submission and records whether
    ///   it exited successfully
    /// - `bjobs` reports `RUN` on the first query of a job, then the record
    /// - `bkill` appends the job id to `dir/killed`
    pub(crate) fn cluster(dir: &Path) -> ClusterConfig {
        let state = dir.display();

        let submit = script(
            dir,
            "fake-bsub",
            &format!(
                r#"while [ $# -gt 0 ]; do
  case "$1" in -*) shift 2 ;; *) break ;; esac
done
id=$(( $(cat "{state}/counter" 2>/dev/null || echo 0) + 1 ))
echo "$id" > "{state}/counter"
if "$@" >/dev/null 2>&1; then echo DONE > "{state}/job-$id"; else echo EXIT > "{state}/job-$id"; fi
echo "Job <$id> is submitted to queue <normal>.""#
            ),
        );
        let status = script(
            dir,
            "fake-bjobs",
            &format!(
                r#"stat=$(cat "{state}/job-$1" 2>/dev/null || echo EXIT)
if [ ! -f "{state}/polled-$1" ]; then touch "{state}/polled-$1"; stat=RUN; fi
printf 'JOBID USER STAT\n%s etl %s\n' "$1" "$stat""#
            ),
        );
        let cancel = script(
            dir,
            "fake-bkill",
            &format!(r#"echo "$1" >> "{state}/killed"; echo "Job <$1> is being terminated""#),
        );

        ClusterConfig::new().with_commands(submit, status, cancel)
    }

    /// Job ids passed to `bkill`.
    pub(crate) fn killed(dir: &Path) -> Vec<u64> {
        fs::read_to_string(dir.join("killed"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }
}
