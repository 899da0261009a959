//! Local Process Backend
//!
//! Spawns the runner as a child of the scheduler and polls it. Processes
//! left behind by an earlier scheduler are tracked by pid, and only count as
//! alive while their command line still names the run's payload file, since
//! the pid may since have been reused.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::debug;
use sysinfo::{Pid, ProcessStatus, System};

use crate::task::{LogMode, TaskStatus};

/// Spawns `command` (program followed by its arguments) with the stream
/// policy of `log`.
pub fn spawn(command: &[OsString], log: &LogMode, target: &str) -> io::Result<Child> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut cmd = Command::new(program);
    cmd.args(args);

    match log {
        LogMode::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        LogMode::Discard => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        LogMode::Files(_) => {
            if let Some((out, err)) = log.paths() {
                cmd.stdout(File::create(&out)?).stderr(File::create(&err)?);
                debug!(target: target, "Logging to {} and {}", out.display(), err.display());
            }
        }
    }

    cmd.spawn()
}

/// Maps the exit code of a child onto a status; no code yet means running.
pub fn poll(child: &mut Child, target: &str) -> TaskStatus {
    match child.try_wait() {
        Ok(Some(status)) if status.success() => TaskStatus::Success,
        Ok(Some(status)) => {
            debug!(target: target, "Process {} exited with {:?}", child.id(), status.code());
            TaskStatus::Error
        }
        Ok(None) => TaskStatus::Running,
        Err(e) => {
            debug!(target: target, "Cannot poll process {}: {}", child.id(), e);
            TaskStatus::Error
        }
    }
}

/// Kills a child and reaps it. A child that already exited is not an error.
pub fn kill(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().map(|_| ())
}

/// Returns true if the process `pid` is alive and is the runner of
/// `infile`, i.e. the payload path is one of its arguments.
pub fn runner_alive(pid: u32, infile: &Path) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);

    if !system.refresh_process(pid) {
        return false;
    }

    system.process(pid).map_or(false, |process| {
        process.status() != ProcessStatus::Zombie
            && process.cmd().iter().any(|arg| Path::new(arg) == infile)
    })
}

/// Sends a kill signal to the runner of `infile`, if it is still alive.
pub fn kill_runner(pid: u32, infile: &Path) -> bool {
    if !runner_alive(pid, infile) {
        return false;
    }

    let mut system = System::new();
    let pid = Pid::from_u32(pid);

    system.refresh_process(pid) && system.process(pid).map_or(false, |process| process.kill())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    const TARGET: &str = "jobgraph::local";

    fn sh(script: &str) -> Vec<OsString> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    /// Like a runner, names its payload file on the command line.
    fn runner_like(script: &str, infile: &Path) -> Vec<OsString> {
        let mut command = sh(script);
        command.push("sh".into());
        command.push(infile.as_os_str().to_owned());
        command
    }

    fn wait_for_exit(child: &mut Child) -> TaskStatus {
        for _ in 0..200 {
            let status = poll(child, TARGET);
            if status.is_terminal() {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("process did not exit");
    }

    #[test]
    fn test_exit_codes() {
        let mut ok = spawn(&sh("exit 0"), &LogMode::Discard, TARGET).unwrap();
        assert_eq!(wait_for_exit(&mut ok), TaskStatus::Success);

        let mut failed = spawn(&sh("exit 3"), &LogMode::Discard, TARGET).unwrap();
        assert_eq!(wait_for_exit(&mut failed), TaskStatus::Error);
    }

    #[test]
    fn test_running_then_killed() {
        let mut child = spawn(&sh("sleep 30"), &LogMode::Discard, TARGET).unwrap();
        assert_eq!(poll(&mut child, TARGET), TaskStatus::Running);

        kill(&mut child).unwrap();
        assert_eq!(poll(&mut child, TARGET), TaskStatus::Error);
    }

    #[test]
    fn test_kill_after_exit_is_ok() {
        let mut child = spawn(&sh("exit 0"), &LogMode::Discard, TARGET).unwrap();
        wait_for_exit(&mut child);
        assert!(kill(&mut child).is_ok());
    }

    #[test]
    fn test_log_files_receive_streams() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("task");
        let log = LogMode::Files(prefix.clone());

        let mut child = spawn(&sh("echo out; echo err >&2"), &log, TARGET).unwrap();
        wait_for_exit(&mut child);

        let (out, err) = log.paths().unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(err).unwrap(), "err\n");
    }

    #[test]
    fn test_reaped_process_is_not_alive() {
        let infile = Path::new("/tmp/jobgraph-reaped.in");
        let mut child = spawn(&runner_like("exit 0", infile), &LogMode::Discard, TARGET).unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!runner_alive(pid, infile));
    }

    #[test]
    fn test_empty_command() {
        let err = spawn(&[], &LogMode::Inherit, TARGET).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_runner_identity_is_checked() {
        let dir = tempdir().unwrap();
        let infile = dir.path().join("task.in");
        let mut runner = spawn(&runner_like("sleep 30; true", &infile), &LogMode::Discard, TARGET).unwrap();
        let mut stranger = spawn(&sh("sleep 30"), &LogMode::Discard, TARGET).unwrap();

        // the command line is only visible once the child has exec'd
        let seen = (0..200).any(|_| {
            thread::sleep(Duration::from_millis(10));
            runner_alive(runner.id(), &infile)
        });
        assert!(seen);
        assert!(!runner_alive(stranger.id(), &infile));
        assert!(!kill_runner(stranger.id(), &infile));
        assert_eq!(poll(&mut stranger, TARGET), TaskStatus::Running);

        assert!(kill_runner(runner.id(), &infile));
        runner.wait().unwrap();
        kill(&mut stranger).unwrap();
    }
}
