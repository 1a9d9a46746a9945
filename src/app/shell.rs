use std::{
    io::{BufRead, BufReader, Read},
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use log::info;
use serde_json::{json, Value};

use crate::models::task::{Task, TaskContext, TaskType};
use crate::retry::policy::RetryPolicy;

const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Task that runs `command` through `sh -c` and yields its output lines.
/// `Task::stop` sends SIGTERM to the child's whole process group.
pub fn shell_task(task_type: impl Into<TaskType>, command: impl Into<String>) -> Task {
    let command = command.into();
    Task::new(task_type, run_shell)
        .with_name(command.clone())
        .with_arg("command", command)
        .long_running()
}

/// Like [`shell_task`], but reruns the command under `policy` until its
/// trimmed output matches `policy.expected` (or it merely succeeds).
/// `Task::stop` ends the running attempt and skips the remaining ones.
pub fn retrying_shell_task(
    task_type: impl Into<TaskType>,
    command: impl Into<String>,
    policy: RetryPolicy,
) -> Task {
    let command = command.into();
    Task::new(task_type, move |ctx| {
        let output = policy
            .until_cancelled(|| ctx.is_cancelled())
            .retry_expecting(|| run_shell(ctx).map(|value| render(&value)))?;
        Ok(Value::String(output))
    })
    .with_name(command.clone())
    .with_arg("command", command)
    .long_running()
}

fn run_shell(ctx: &TaskContext<'_>) -> anyhow::Result<Value> {
    let command = ctx
        .arg("command")
        .and_then(Value::as_str)
        .context("missing 'command' argument")?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to run '{}'", command))?;

    let stdout = child.stdout.take().context("child stdout not captured")?;
    let stderr = child.stderr.take().context("child stderr not captured")?;
    let stdout_reader = thread::spawn(move || read_lines(stdout, "[stdout]"));
    let stderr_reader = thread::spawn(move || read_lines(stderr, "[stderr]"));

    let mut terminated = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if ctx.is_cancelled() && !terminated {
            // The child leads its own group; signal all of it so pipelines and
            // command lists do not outlive the shell.
            unsafe {
                libc::kill(-(child.id() as i32), libc::SIGTERM);
            }
            terminated = true;
            info!("Sent SIGTERM to '{}' (process group {}).", command, child.id());
        }
        thread::sleep(WAIT_INTERVAL);
    };

    let mut output = stdout_reader.join().unwrap_or_default();
    output.extend(stderr_reader.join().unwrap_or_default());

    if terminated {
        bail!("'{}' stopped", command);
    }
    if !status.success() {
        bail!("'{}' exited with {}", command, status);
    }
    Ok(json!(output))
}

fn read_lines<R: Read>(source: R, prefix: &str) -> Vec<String> {
    BufReader::new(source)
        .lines()
        .map_while(Result::ok)
        .map(|line| format!("{} {}", prefix, line))
        .collect()
}

/// Joins captured lines back into plain text, dropping the stream prefixes.
fn render(value: &Value) -> String {
    match value {
        Value::Array(lines) => lines
            .iter()
            .filter_map(Value::as_str)
            .map(|line| {
                line.strip_prefix("[stdout] ")
                    .or_else(|| line.strip_prefix("[stderr] "))
                    .unwrap_or(line)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
