//! Run Store
//!
//! SQLite persistence of tasks and their runs. The store is the only state
//! that survives the scheduler; every invocation re-associates its tasks
//! with their rows by name.
//!
//! ```text
//! task(id, name UNIQUE)
//! run(task_id, active, status, infile, outfile, job_id, pid, result,
//!     create_time, start_time, end_time)
//! ```
//!
//! `status` is NULL while pending, then `running`, `success` or `error`.
//! At most one run per task is active; superseded runs stay as history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::task::{PayloadFiles, TaskStatus};
use crate::value::Value;
use crate::DEFAULT_LOG_TARGET;

/// Format of every timestamp column, in UTC.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task (
  id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS run (
  task_id INTEGER NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  status TEXT DEFAULT NULL,
  infile TEXT DEFAULT NULL,
  outfile TEXT DEFAULT NULL,
  job_id INTEGER DEFAULT NULL,
  pid INTEGER DEFAULT NULL,
  result TEXT DEFAULT NULL,
  create_time TEXT NOT NULL,
  start_time TEXT DEFAULT NULL,
  end_time TEXT DEFAULT NULL,
  FOREIGN KEY(task_id) REFERENCES task(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS run_single_active ON run(task_id) WHERE active = 1;
";

/// The active run of a task, as seen at the start of a tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActiveRun {
    pub status: TaskStatus,
    pub infile: Option<PathBuf>,
    pub outfile: Option<PathBuf>,
    pub job_id: Option<u64>,
    pub pid: Option<u32>,
    pub result: Option<Value>,
}

impl ActiveRun {
    /// Payload files, if the run was started.
    pub fn files(&self) -> Option<PayloadFiles> {
        match (&self.infile, &self.outfile) {
            (Some(infile), Some(outfile)) => Some(PayloadFiles {
                infile: infile.clone(),
                outfile: outfile.clone(),
            }),
            _ => None,
        }
    }
}

/// One run, active or not, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub task: String,
    pub active: bool,
    pub status: TaskStatus,
    pub job_id: Option<u64>,
    pub pid: Option<u32>,
    pub result: Option<Value>,
    pub create_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// A change to the active run of a task, written in batches.
#[derive(Debug, Clone, PartialEq)]
pub enum RunChange {
    /// The task was handed to its backend
    Started {
        task_id: i64,
        files: Option<PayloadFiles>,
        job_id: Option<u64>,
        pid: Option<u32>,
    },
    /// The run reached a final status
    Finished {
        task_id: i64,
        status: TaskStatus,
        result: Option<Value>,
    },
}

/// Handle on the store file.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
    log_target: String,
}

fn now() -> String {
    Utc::now().format(TIME_FORMAT).to_string()
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_result(text: Option<String>) -> Result<Option<Value>> {
    match text {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

type RawRecord = (
    String,
    bool,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

const RECORD_COLUMNS: &str = "task.name, run.active, run.status, run.job_id, run.pid, run.result, \
                              run.create_time, run.start_time, run.end_time";

impl Store {
    /// Opens the store, creating the file and tables if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_target(path, DEFAULT_LOG_TARGET)
    }

    /// Same as [`Store::open`], logging under `target`.
    pub fn open_with_target(path: impl AsRef<Path>, target: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        debug!(target: target, "Opened store {}", path.display());
        Ok(Self {
            conn,
            path,
            log_target: target.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the id of every name, inserting the missing ones.
    pub fn register_tasks(&mut self, names: &[&str]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(names.len());

        for name in names {
            let inserted = tx.execute("INSERT OR IGNORE INTO task (name) VALUES (?1)", params![name])?;
            if inserted > 0 {
                info!(target: self.log_target.as_str(), "Registered new task '{}'", name);
            }
            let id: i64 = tx.query_row("SELECT id FROM task WHERE name = ?1", params![name], |row| row.get(0))?;
            ids.push(id);
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Every task known to the store, by id.
    pub fn tasks(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM task ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active runs keyed by task id.
    pub fn active_runs(&self) -> Result<HashMap<i64, ActiveRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, status, infile, outfile, job_id, pid, result FROM run WHERE active = 1",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut runs = HashMap::new();
        for row in rows {
            let (task_id, status, infile, outfile, job_id, pid, result) = row?;
            runs.insert(
                task_id,
                ActiveRun {
                    status: TaskStatus::from_db(status.as_deref()),
                    infile: infile.map(PathBuf::from),
                    outfile: outfile.map(PathBuf::from),
                    job_id: job_id.and_then(|id| u64::try_from(id).ok()),
                    pid: pid.and_then(|pid| u32::try_from(pid).ok()),
                    result: parse_result(result)?,
                },
            );
        }

        Ok(runs)
    }

    /// Supersedes the active run of each task with a new pending one.
    pub fn activate(&mut self, task_ids: &[i64]) -> Result<()> {
        let created = now();
        let tx = self.conn.transaction()?;

        for task_id in task_ids {
            tx.execute(
                "UPDATE run SET active = 0 WHERE task_id = ?1 AND active = 1",
                params![task_id],
            )?;
            tx.execute(
                "INSERT INTO run (task_id, active, create_time) VALUES (?1, 1, ?2)",
                params![task_id, created],
            )?;
        }

        tx.commit()?;
        debug!(target: self.log_target.as_str(), "Activated {} runs", task_ids.len());
        Ok(())
    }

    /// Applies a batch of changes in one transaction.
    pub fn record(&mut self, changes: &[RunChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let timestamp = now();
        let tx = self.conn.transaction()?;

        for change in changes {
            match change {
                RunChange::Started {
                    task_id,
                    files,
                    job_id,
                    pid,
                } => {
                    tx.execute(
                        "UPDATE run SET status = ?1, infile = ?2, outfile = ?3, job_id = ?4, pid = ?5, \
                         start_time = ?6 WHERE task_id = ?7 AND active = 1",
                        params![
                            TaskStatus::Running.to_db(),
                            files.as_ref().map(|f| path_text(&f.infile)),
                            files.as_ref().map(|f| path_text(&f.outfile)),
                            job_id.and_then(|id| i64::try_from(id).ok()),
                            pid.map(i64::from),
                            timestamp,
                            task_id,
                        ],
                    )?;
                }
                RunChange::Finished {
                    task_id,
                    status,
                    result,
                } => {
                    let result = serde_json::to_string(result.as_ref().unwrap_or(&Value::Null))?;
                    tx.execute(
                        "UPDATE run SET status = ?1, result = ?2, end_time = ?3 \
                         WHERE task_id = ?4 AND active = 1",
                        params![status.to_db(), result, timestamp, task_id],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Every run of a task, oldest first. Unknown names have no runs.
    pub fn history(&self, name: &str) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {} FROM run INNER JOIN task ON task.id = run.task_id \
             WHERE task.name = ?1 ORDER BY run.rowid",
            RECORD_COLUMNS
        );
        self.records(&sql, params![name])
    }

    /// The active run of every task that has one, by task id.
    pub fn latest(&self) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {} FROM run INNER JOIN task ON task.id = run.task_id \
             WHERE run.active = 1 ORDER BY task.id",
            RECORD_COLUMNS
        );
        self.records(&sql, [])
    }

    /// Id of a task name, if registered.
    pub fn task_id(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM task WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?)
    }

    fn records<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| -> rusqlite::Result<RawRecord> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (task, active, status, job_id, pid, result, create_time, start_time, end_time) = row?;
            records.push(RunRecord {
                task,
                active,
                status: TaskStatus::from_db(status.as_deref()),
                job_id: job_id.and_then(|id| u64::try_from(id).ok()),
                pid: pid.and_then(|pid| u32::try_from(pid).ok()),
                result: parse_result(result)?,
                create_time,
                start_time,
                end_time,
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("runs.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_register_is_idempotent() {
        let (_dir, mut store) = open();
        let first = store.register_tasks(&["a", "b"]).unwrap();
        let second = store.register_tasks(&["b", "a", "c"]).unwrap();

        assert_eq!(second[0], first[1]);
        assert_eq!(second[1], first[0]);
        assert_eq!(store.tasks().unwrap().len(), 3);
        assert_eq!(store.task_id("c").unwrap(), Some(second[2]));
        assert_eq!(store.task_id("zzz").unwrap(), None);
    }

    #[test]
    fn test_activate_keeps_history() {
        let (_dir, mut store) = open();
        let ids = store.register_tasks(&["a"]).unwrap();

        store.activate(&ids).unwrap();
        store.activate(&ids).unwrap();

        let history = store.history("a").unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].active);
        assert!(history[1].active);
        assert_eq!(history[1].status, TaskStatus::Pending);

        let active = store.active_runs().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[&ids[0]].status, TaskStatus::Pending);
    }

    #[test]
    fn test_single_active_run_is_enforced() {
        let (_dir, mut store) = open();
        let ids = store.register_tasks(&["a"]).unwrap();
        store.activate(&ids).unwrap();

        let duplicate = store.conn.execute(
            "INSERT INTO run (task_id, active, create_time) VALUES (?1, 1, 'now')",
            params![ids[0]],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_record_started_and_finished() {
        let (_dir, mut store) = open();
        let ids = store.register_tasks(&["a", "b"]).unwrap();
        store.activate(&ids).unwrap();

        store
            .record(&[
                RunChange::Started {
                    task_id: ids[0],
                    files: Some(PayloadFiles {
                        infile: PathBuf::from("/tmp/x.in"),
                        outfile: PathBuf::from("/tmp/x.out"),
                    }),
                    job_id: None,
                    pid: Some(4242),
                },
                RunChange::Finished {
                    task_id: ids[1],
                    status: TaskStatus::Error,
                    result: None,
                },
            ])
            .unwrap();

        let active = store.active_runs().unwrap();
        let started = &active[&ids[0]];
        assert_eq!(started.status, TaskStatus::Running);
        assert_eq!(started.pid, Some(4242));
        assert_eq!(started.files().unwrap().outfile, PathBuf::from("/tmp/x.out"));

        let failed = &store.history("b").unwrap()[0];
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.result, Some(Value::Null));
        assert!(failed.start_time.is_none());
        assert!(failed.end_time.is_some());

        store
            .record(&[RunChange::Finished {
                task_id: ids[0],
                status: TaskStatus::Success,
                result: Some(Value::Int(5)),
            }])
            .unwrap();
        assert_eq!(store.active_runs().unwrap()[&ids[0]].result, Some(Value::Int(5)));
    }

    #[test]
    fn test_timestamp_format() {
        let (_dir, mut store) = open();
        let ids = store.register_tasks(&["a"]).unwrap();
        store.activate(&ids).unwrap();

        let record = &store.latest().unwrap()[0];
        assert!(chrono::NaiveDateTime::parse_from_str(&record.create_time, TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.sqlite");

        {
            let mut store = Store::open(&path).unwrap();
            let ids = store.register_tasks(&["a"]).unwrap();
            store.activate(&ids).unwrap();
            store
                .record(&[RunChange::Finished {
                    task_id: ids[0],
                    status: TaskStatus::Success,
                    result: Some(Value::from("done")),
                }])
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let latest = store.latest().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].task, "a");
        assert_eq!(latest[0].status, TaskStatus::Success);
        assert_eq!(latest[0].result, Some(Value::from("done")));
    }

    #[test]
    fn test_history_of_unknown_task_is_empty() {
        let (_dir, store) = open();
        assert!(store.history("nobody").unwrap().is_empty());
    }
}
