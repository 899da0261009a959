//! Built-in Task Functions
//!
//! The registry served by the `jobgraph` binary, so that workflows defined in
//! YAML can run without a custom runner:
//!
//! | key       | behavior                                                         |
//! |-----------|------------------------------------------------------------------|
//! | `shell`   | runs the last argument with `sh -c`; earlier arguments are `$1`… |
//! | `echo`    | returns its argument, its arguments as a list, or null           |
//! | `sum`     | adds numbers, one level of lists included                        |
//! | `sleep`   | sleeps for the given number of seconds                           |
//! | `fail`    | always fails, with the given message                             |
//! | `inspect` | returns `{"args": [...], "kwargs": {...}}` as received           |
//!
//! `shell` returns its trimmed stdout, decoded as JSON when possible
//! (`echo 5` yields the integer 5) and as a string otherwise.

use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::error::BoxError;
use crate::registry::Registry;
use crate::value::{Kwargs, Value};

/// Registry with every built-in function, under the default name.
pub fn registry() -> Registry {
    Registry::default()
        .register("shell", shell)
        .register("echo", echo)
        .register("sum", sum)
        .register("sleep", sleep)
        .register("fail", fail)
        .register("inspect", inspect)
}

fn as_shell_arg(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn shell(args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, BoxError> {
    let (command, params) = args.split_last().ok_or("shell: missing command")?;
    let command = command
        .as_str()
        .ok_or_else(|| format!("shell: command must be a string, not {}", command.kind()))?;

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .arg("sh")
        .args(params.iter().map(as_shell_arg))
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()?;

    if !output.status.success() {
        return Err(format!("shell: '{}' exited with {}", command, output.status).into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();

    if stdout.is_empty() {
        return Ok(Value::Null);
    }

    Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::Str(stdout.to_string())))
}

fn echo(mut args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, BoxError> {
    Ok(match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::List(args),
    })
}

fn sum(args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, BoxError> {
    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut is_float = false;

    let mut add = |value: &Value| -> Result<(), BoxError> {
        match value {
            Value::Int(i) => {
                int_total = int_total.checked_add(*i).ok_or("sum: integer overflow")?;
            }
            Value::Float(f) => {
                is_float = true;
                float_total += f;
            }
            other => return Err(format!("sum: cannot add a {}", other.kind()).into()),
        }
        Ok(())
    };

    for arg in &args {
        match arg {
            Value::List(items) => items.iter().try_for_each(&mut add)?,
            other => add(other)?,
        }
    }

    if is_float {
        Ok(Value::Float(float_total + int_total as f64))
    } else {
        Ok(Value::Int(int_total))
    }
}

fn sleep(args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, BoxError> {
    let seconds = args.first().and_then(Value::as_f64).unwrap_or(0.0);
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("sleep: invalid duration {}", seconds).into());
    }

    thread::sleep(Duration::from_secs_f64(seconds));
    Ok(Value::Null)
}

fn fail(args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, BoxError> {
    let message = args
        .first()
        .map(as_shell_arg)
        .unwrap_or_else(|| "task failed".to_string());
    Err(message.into())
}

fn inspect(args: Vec<Value>, kwargs: Kwargs) -> Result<Value, BoxError> {
    let mut call = Kwargs::new();
    call.insert("args".to_string(), Value::List(args));
    call.insert("kwargs".to_string(), Value::Map(kwargs));
    Ok(Value::Map(call))
}
