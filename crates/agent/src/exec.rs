//! Instruction subprocess execution.
//!
//! Each run gets its own execution directory (staged from an image or
//! created empty), an environment enriched with the agent's execution
//! variables, and line-by-line streaming of stdout/stderr into the process
//! log. Output is concurrently captured: one-time instructions interleave
//! both streams into a single buffer preserving arrival order; periodic
//! instructions keep the streams separate.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use sentinel_common::CommonInstruction;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::image::{ImageStager, StageError};

/// Environment variable carrying the execution directory path.
pub const EXECUTION_PWD_ENV: &str = "CATTLE_AGENT_EXECUTION_PWD";
/// Environment variable carrying the one-based attempt number.
pub const ATTEMPT_NUMBER_ENV: &str = "CATTLE_AGENT_ATTEMPT_NUMBER";

/// Command run when an instruction does not name one.
const DEFAULT_COMMAND: &str = "run.sh";

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("failed to create execution directory {dir}: {source}")]
    WorkDir {
        dir: String,
        source: std::io::Error,
    },
    #[error("failed to start {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("execution cancelled")]
    Cancelled,
}

/// How captured output is grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Both streams interleaved into `RunOutput::stdout` in arrival order.
    Combined,
    /// Streams captured separately.
    Split,
}

#[derive(Debug, Default)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Run one instruction to completion inside `dir`.
///
/// A non-zero exit is an `Ok` result carrying the exit code; `Err` means the
/// process never ran (staging, directory, or spawn failure) or was cancelled
/// mid-flight. On cancellation the child is killed via the exec API.
pub async fn execute(
    ctx: &CancellationToken,
    stager: &dyn ImageStager,
    prefix: &str,
    dir: &Path,
    instruction: &CommonInstruction,
    mode: CaptureMode,
    attempt: u32,
) -> Result<RunOutput, ExecError> {
    if instruction.image.is_empty() {
        debug!(dir = %dir.display(), "no image provided, creating empty execution directory");
        std::fs::create_dir_all(dir).map_err(|source| ExecError::WorkDir {
            dir: dir.display().to_string(),
            source,
        })?;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755));
    } else {
        info!(image = %instruction.image, dir = %dir.display(), "staging instruction image");
        stager.stage(dir, &instruction.image).await?;
    }

    let command = if instruction.command.is_empty() {
        let fallback = dir.join(DEFAULT_COMMAND);
        debug!(command = %fallback.display(), "command not specified, using default");
        fallback.display().to_string()
    } else {
        instruction.command.clone()
    };

    let parent_path = std::env::var("PATH").unwrap_or_default();

    let mut cmd = Command::new(&command);
    cmd.args(&instruction.args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for pair in &instruction.env {
        if let Some((key, value)) = pair.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.env(EXECUTION_PWD_ENV, dir)
        .env("PATH", format!("{}:{}", parent_path, dir.display()))
        .env(ATTEMPT_NUMBER_ENV, attempt.to_string());

    info!(%command, args = ?instruction.args, "running command");
    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: command.clone(),
        source,
    })?;

    let stdout_buffer = Arc::new(Mutex::new(Vec::new()));
    let stderr_buffer = match mode {
        CaptureMode::Combined => stdout_buffer.clone(),
        CaptureMode::Split => Arc::new(Mutex::new(Vec::new())),
    };

    let stdout_task = child.stdout.take().map(|pipe| {
        tokio::spawn(stream_output(
            format!("[{prefix}:stdout]"),
            pipe,
            stdout_buffer.clone(),
        ))
    });
    let stderr_task = child.stderr.take().map(|pipe| {
        tokio::spawn(stream_output(
            format!("[{prefix}:stderr]"),
            pipe,
            stderr_buffer.clone(),
        ))
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = ctx.cancelled() => {
            error!(%command, "cancellation requested, killing command");
            let _ = child.start_kill();
            let _ = child.wait().await;
            if let Some(task) = stdout_task { let _ = task.await; }
            if let Some(task) = stderr_task { let _ = task.await; }
            return Err(ExecError::Cancelled);
        }
    };

    // Drain the pipes before reading the buffers.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    };
    info!(%command, exit_code, "command finished");

    let stdout = std::mem::take(&mut *stdout_buffer.lock());
    let stderr = match mode {
        CaptureMode::Combined => Vec::new(),
        CaptureMode::Split => std::mem::take(&mut *stderr_buffer.lock()),
    };
    Ok(RunOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Log each line with `prefix` and append it (newline-terminated) to the
/// shared buffer. The buffer lock is held only per line, so combined capture
/// preserves arrival order across both streams.
async fn stream_output(
    prefix: String,
    pipe: impl AsyncRead + Unpin,
    buffer: Arc<Mutex<Vec<u8>>>,
) {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                    line.pop();
                }
                info!("{}: {}", prefix, String::from_utf8_lossy(&line));
                let mut captured = buffer.lock();
                captured.extend_from_slice(&line);
                captured.push(b'\n');
            }
            Err(err) => {
                debug!(%prefix, %err, "output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoStager;

    #[async_trait]
    impl ImageStager for NoStager {
        async fn stage(&self, _dir: &Path, image: &str) -> Result<(), StageError> {
            Err(StageError::NotAvailable {
                image: image.to_string(),
            })
        }
    }

    fn instruction(command: &str, args: &[&str]) -> CommonInstruction {
        CommonInstruction {
            name: "test".to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..CommonInstruction::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let work = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let output = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &work.path().join("exec"),
            &instruction("echo", &["test"]),
            CaptureMode::Combined,
            1,
        )
        .await
        .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, b"test\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn split_mode_separates_streams() {
        let work = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let output = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &work.path().join("exec"),
            &instruction("sh", &["-c", "echo out; echo err >&2"]),
            CaptureMode::Split,
            1,
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let work = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let output = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &work.path().join("exec"),
            &instruction("sh", &["-c", "exit 7"]),
            CaptureMode::Combined,
            1,
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 7);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let work = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let err = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &work.path().join("exec"),
            &instruction("/nonexistent/binary", &[]),
            CaptureMode::Combined,
            1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn injects_execution_environment() {
        let work = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let dir = work.path().join("exec");
        let output = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &dir,
            &instruction(
                "sh",
                &["-c", "echo $CATTLE_AGENT_EXECUTION_PWD $CATTLE_AGENT_ATTEMPT_NUMBER $EXTRA"],
            ),
            CaptureMode::Combined,
            3,
        )
        .await
        .unwrap();

        let output_with_env = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &dir,
            &CommonInstruction {
                command: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "echo $CATTLE_AGENT_EXECUTION_PWD $CATTLE_AGENT_ATTEMPT_NUMBER $EXTRA"
                        .to_string(),
                ],
                env: vec!["EXTRA=bonus".to_string()],
                ..CommonInstruction::default()
            },
            CaptureMode::Combined,
            3,
        )
        .await
        .unwrap();

        let text = String::from_utf8(output.stdout).unwrap();
        assert!(text.contains(dir.to_str().unwrap()));
        assert!(text.contains('3'));

        let text = String::from_utf8(output_with_env.stdout).unwrap();
        assert!(text.contains("bonus"));
    }

    #[tokio::test]
    async fn default_command_is_run_sh_in_execution_dir() {
        let work = tempfile::tempdir().unwrap();
        let dir = work.path().join("exec");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), "#!/bin/sh\necho from-default\n").unwrap();
        std::fs::set_permissions(dir.join("run.sh"), std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let ctx = CancellationToken::new();
        let output = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &dir,
            &CommonInstruction::default(),
            CaptureMode::Combined,
            1,
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, b"from-default\n");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let work = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = execute(
            &ctx,
            &NoStager,
            "abc_0",
            &work.path().join("exec"),
            &instruction("sleep", &["60"]),
            CaptureMode::Combined,
            1,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExecError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
