use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::{PipelineError, Result};

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` through `sh -c` in `dir`.
///
/// Stdout lines are collected and echoed at debug level; stderr is drained
/// by a background task and attached to the error on a non-zero exit.
pub async fn run_shell(command: &str, dir: &Path, env: &[(String, String)]) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::CommandFailed {
            command: command.to_string(),
            status: "stdout not captured".into(),
            stderr: String::new(),
        })?;

    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let drain = child.stderr.take().map(|stderr| {
        let buf = Arc::clone(&stderr_buf);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Ok(mut b) = buf.lock() {
                    if !b.is_empty() {
                        b.push('\n');
                    }
                    b.push_str(&line);
                }
            }
        })
    });

    let mut out = String::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        debug!(target: "stagewalk::pipeline", "{line}");
        out.push_str(&line);
        out.push('\n');
    }

    let status = child.wait().await?;
    if let Some(task) = drain {
        let _ = task.await;
    }
    let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();

    if status.success() {
        return Ok(CommandOutput { stdout: out, stderr });
    }
    let status = match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_string(),
    };
    Err(PipelineError::CommandFailed {
        command: command.to_string(),
        status,
        stderr,
    })
}
