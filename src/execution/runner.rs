//! Out-of-Process Runner
//!
//! Entry point executed in a fresh process for every task:
//!
//! ```text
//! <program> __jobgraph-runner <infile> <outfile>
//! ```
//!
//! The runner decodes the payload, resolves the function in its registry,
//! invokes it and, only on success, writes the JSON result to `outfile`.
//! Failures are reported on stderr and through the exit status; no
//! structured error crosses the process boundary.
//!
//! Any binary can serve as a runner by calling [`dispatch`] first thing in
//! `main`:
//!
//! ```rust,no_run
//! use std::process::ExitCode;
//! use jobgraph::registry::Registry;
//! use jobgraph::runner;
//!
//! fn main() -> ExitCode {
//!     let registry = Registry::new("etl");
//!     if let Some(code) = runner::dispatch(&registry) {
//!         return code;
//!     }
//!     // regular program ...
//!     ExitCode::SUCCESS
//! }
//! ```

use std::any::Any;
use std::sync::Once;
use std::cell::{Cell, RefCell};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::ExitCode;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::value::Value;

use super::payload::{Call, Payload};

/// Argument that switches a binary into runner mode.
pub const RUNNER_ARG: &str = "__jobgraph-runner";

/// Exit status when the task function fails or panics.
pub const EXIT_TASK_FAILED: u8 = 1;

/// Exit status when the payload cannot be decoded or resolved.
pub const EXIT_BAD_PAYLOAD: u8 = 2;

thread_local! {
    static CAPTURING: Cell<bool> = Cell::new(false);
    static LOCATION: RefCell<Option<String>> = RefCell::new(None);
}

static HOOK: Once = Once::new();

/// Runs the task described by the process arguments, if they request it.
///
/// Returns `None` when the process was not started as a runner, so the caller
/// can continue with its normal `main`.
pub fn dispatch(registry: &Registry) -> Option<ExitCode> {
    let args: Vec<OsString> = env::args_os().collect();

    if args.get(1).map_or(true, |arg| arg != RUNNER_ARG) {
        return None;
    }

    if args.len() != 4 {
        eprintln!("usage: <program> {} <infile> <outfile>", RUNNER_ARG);
        return Some(ExitCode::from(EXIT_BAD_PAYLOAD));
    }

    Some(run(registry, Path::new(&args[2]), Path::new(&args[3])))
}

/// Executes one payload file and records its result.
pub fn run(registry: &Registry, infile: &Path, outfile: &Path) -> ExitCode {
    ExitCode::from(execute(registry, infile, outfile))
}

/// Same as [`run`], returning the raw exit status.
pub fn execute(registry: &Registry, infile: &Path, outfile: &Path) -> u8 {
    let payload = match load(registry, infile) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("{}: {}", infile.display(), e);
            return EXIT_BAD_PAYLOAD;
        }
    };

    let Some(function) = registry.get(&payload.function) else {
        eprintln!("{}", Error::UnknownFunction(payload.function));
        return EXIT_BAD_PAYLOAD;
    };

    let Call { args, kwargs } = payload.call;
    let outcome = contained(|| function(args, kwargs));

    match outcome {
        Ok(Ok(value)) => match write_result(outfile, &value) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{}: cannot write result: {}", payload.function, e);
                EXIT_TASK_FAILED
            }
        },
        Ok(Err(e)) => {
            eprintln!("{}: error: {}", payload.function, e);
            EXIT_TASK_FAILED
        }
        Err(diagnostic) => {
            eprintln!("{}: panic: {}", payload.function, diagnostic);
            EXIT_TASK_FAILED
        }
    }
}

fn load(registry: &Registry, infile: &Path) -> Result<Payload> {
    let payload = Payload::read_from(infile)?;

    if payload.registry != registry.name() {
        return Err(Error::RegistryMismatch {
            expected: registry.name().to_string(),
            found: payload.registry,
        });
    }

    Ok(payload)
}

/// Writes next to the destination and renames, so a reader never sees a
/// partially written result.
fn write_result(outfile: &Path, value: &Value) -> Result<()> {
    let mut partial = outfile.as_os_str().to_owned();
    partial.push(".part");

    fs::write(&partial, serde_json::to_vec(value)?)?;
    fs::rename(&partial, outfile)?;
    Ok(())
}

/// Records the location of panics raised while [`contained`] runs on the
/// current thread; any other panic goes to the previous hook.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let location = info
                    .location()
                    .map(|location| format!("{}:{}", location.file(), location.line()));
                LOCATION.with(|slot| *slot.borrow_mut() = location);
            } else {
                previous(info);
            }
        }));
    });
}

/// Runs `f`, turning a panic into `"<message> at <file>:<line>"`.
fn contained<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    install_hook();

    CAPTURING.with(|flag| flag.set(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    CAPTURING.with(|flag| flag.set(false));

    outcome.map_err(|panic| {
        let message = panic_message(&*panic);
        match LOCATION.with(|slot| slot.borrow_mut().take()) {
            Some(location) => format!("{} at {}", message, location),
            None => message,
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kwargs;
    use tempfile::tempdir;

    fn registry() -> Registry {
        Registry::new("test")
            .register("add", |args, _| {
                let total: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(Value::Int(total))
            })
            .register("fail", |_, _| Err("boom".into()))
            .register("panic", |_, _| panic!("exploded"))
    }

    fn write_payload(dir: &Path, registry: &str, function: &str, args: Vec<Value>) -> std::path::PathBuf {
        let path = dir.join(format!("{}.in", function));
        let call = Call {
            args,
            kwargs: Kwargs::new(),
        };
        Payload::new(registry, function, call).write_to(&path).unwrap();
        path
    }

    #[test]
    fn test_success_writes_result() {
        let dir = tempdir().unwrap();
        let infile = write_payload(dir.path(), "test", "add", vec![Value::Int(2), Value::Int(3)]);
        let outfile = dir.path().join("add.out");

        assert_eq!(execute(&registry(), &infile, &outfile), 0);

        let result: Value = serde_json::from_slice(&fs::read(&outfile).unwrap()).unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_error_leaves_no_output() {
        let dir = tempdir().unwrap();
        let infile = write_payload(dir.path(), "test", "fail", Vec::new());
        let outfile = dir.path().join("fail.out");

        assert_eq!(execute(&registry(), &infile, &outfile), EXIT_TASK_FAILED);
        assert!(!outfile.exists());
    }

    #[test]
    fn test_panic_is_contained() {
        let dir = tempdir().unwrap();
        let infile = write_payload(dir.path(), "test", "panic", Vec::new());
        let outfile = dir.path().join("panic.out");

        assert_eq!(execute(&registry(), &infile, &outfile), EXIT_TASK_FAILED);
        assert!(!outfile.exists());
    }

    #[test]
    fn test_unknown_function() {
        let dir = tempdir().unwrap();
        let infile = write_payload(dir.path(), "test", "missing", Vec::new());
        let outfile = dir.path().join("missing.out");

        assert_eq!(execute(&registry(), &infile, &outfile), EXIT_BAD_PAYLOAD);
    }

    #[test]
    fn test_wrong_registry() {
        let dir = tempdir().unwrap();
        let infile = write_payload(dir.path(), "other", "add", Vec::new());
        let outfile = dir.path().join("add.out");

        assert_eq!(execute(&registry(), &infile, &outfile), EXIT_BAD_PAYLOAD);
        assert!(!outfile.exists());
    }

    #[test]
    fn test_missing_infile() {
        let dir = tempdir().unwrap();
        let code = execute(&registry(), &dir.path().join("nope.in"), &dir.path().join("nope.out"));
        assert_eq!(code, EXIT_BAD_PAYLOAD);
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }

    #[test]
    fn test_panic_diagnostic_has_location() {
        let line = line!() + 1;
        let diagnostic = contained(|| -> i64 { panic!("exploded") }).unwrap_err();

        assert!(diagnostic.starts_with("exploded at "));
        assert!(diagnostic.ends_with(&format!("runner.rs:{}", line)));
        assert_eq!(contained(|| 7), Ok(7));
    }
}
