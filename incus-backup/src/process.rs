//! Subprocess plumbing shared by the incus and restic collaborators.
//!
//! Children are killed when their future is dropped or the cancellation
//! token fires. Stderr is drained on a side task so a chatty child can
//! never block on a full pipe while we stream its stdin or stdout.

use crate::transfer::{ByteSink, ByteStream};
use crate::utils::errors::{BackupError, Result};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured result of a finished child.
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl Finished {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Trimmed stderr, or the exit status when stderr is empty.
    pub fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.status.to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// `program arg arg ...` for logs and error messages.
pub fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut text = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        text.push(' ');
        text.push_str(&arg.to_string_lossy());
    }
    text
}

fn spawn(cmd: &mut Command, stdin: Stdio, stdout: Stdio) -> Result<Child> {
    cmd.kill_on_drop(true).stdin(stdin).stdout(stdout).stderr(Stdio::piped());
    debug!(command = %describe(cmd), "spawning");
    cmd.spawn().map_err(|e| {
        BackupError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to start {}: {}", describe(cmd), e),
        ))
    })
}

fn drain_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    })
}

async fn finish(mut child: Child, stderr: JoinHandle<String>, stdout: Vec<u8>) -> Result<Finished> {
    let status = child.wait().await?;
    let stderr = stderr.await.unwrap_or_default();
    Ok(Finished { status, stdout, stderr })
}

/// Run to completion, capturing stdout and stderr.
pub async fn output(mut cmd: Command, cancel: &CancellationToken) -> Result<Finished> {
    let mut child = spawn(&mut cmd, Stdio::null(), Stdio::piped())?;
    let stderr = drain_stderr(&mut child);
    let mut stdout = child.stdout.take();

    let work = async move {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            out.read_to_end(&mut buf).await?;
        }
        finish(child, stderr, buf).await
    };

    tokio::select! {
        result = work => result,
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
    }
}

/// Which end of a stdin copy failed.
enum Feed {
    Source(std::io::Error),
    Child(std::io::Error),
}

async fn pump(source: &mut ByteStream, stdin: &mut ChildStdin) -> std::result::Result<(), Feed> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf).await.map_err(Feed::Source)?;
        if n == 0 {
            break;
        }
        stdin.write_all(&buf[..n]).await.map_err(Feed::Child)?;
    }
    stdin.shutdown().await.map_err(Feed::Child)
}

async fn kill(child: &mut Child, cmd: &Command) {
    if let Err(e) = child.kill().await {
        warn!(command = %describe(cmd), "failed to kill child: {}", e);
    }
}

/// Run with `source` streamed into stdin.
///
/// If the source fails the child is killed while its stdin is still open,
/// so it never mistakes a truncated stream for a complete one. If the child
/// stops reading early, its own exit status and stderr are returned.
pub async fn feed(mut cmd: Command, source: &mut ByteStream, cancel: &CancellationToken) -> Result<Finished> {
    let mut child = spawn(&mut cmd, Stdio::piped(), Stdio::null())?;
    let stderr = drain_stderr(&mut child);
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BackupError::Transport("child stdin unavailable".into()))?;

    let pumped = tokio::select! {
        result = pump(source, &mut stdin) => result,
        _ = cancel.cancelled() => {
            kill(&mut child, &cmd).await;
            return Err(BackupError::Cancelled);
        }
    };

    let child_error = match pumped {
        Ok(()) => None,
        Err(Feed::Source(e)) => {
            kill(&mut child, &cmd).await;
            return Err(BackupError::Transport(format!("streaming into {}: {}", describe(&cmd), e)));
        }
        Err(Feed::Child(e)) => Some(e),
    };
    drop(stdin);

    let finished = tokio::select! {
        result = finish(child, stderr, Vec::new()) => result?,
        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
    };
    match child_error {
        Some(e) if finished.success() => {
            Err(BackupError::Transport(format!("streaming into {}: {}", describe(&cmd), e)))
        }
        _ => Ok(finished),
    }
}

/// Run with stdout streamed into `sink`. The sink is shut down after the
/// child's stdout ends.
pub async fn drain(mut cmd: Command, sink: &mut ByteSink, cancel: &CancellationToken) -> Result<Finished> {
    let mut child = spawn(&mut cmd, Stdio::null(), Stdio::piped())?;
    let stderr = drain_stderr(&mut child);
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::Transport("child stdout unavailable".into()))?;

    let copied = tokio::select! {
        result = tokio::io::copy(&mut stdout, sink) => result,
        _ = cancel.cancelled() => {
            kill(&mut child, &cmd).await;
            return Err(BackupError::Cancelled);
        }
    };
    if let Err(e) = copied {
        kill(&mut child, &cmd).await;
        return Err(if e.kind() == std::io::ErrorKind::BrokenPipe {
            BackupError::PipeClosed
        } else {
            BackupError::Transport(format!("streaming from {}: {}", describe(&cmd), e))
        });
    }

    let finished = tokio::select! {
        result = finish(child, stderr, Vec::new()) => result?,
        _ = cancel.cancelled() => return Err(BackupError::Cancelled),
    };
    if finished.success() {
        sink.shutdown().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                BackupError::PipeClosed
            } else {
                BackupError::Transport(format!("closing output of {}: {}", describe(&cmd), e))
            }
        })?;
    }
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_output_captures_streams() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let finished = output(cmd, &CancellationToken::new()).await.unwrap();
        assert!(!finished.success());
        assert_eq!(finished.stdout_text(), "out\n");
        assert_eq!(finished.failure_text(), "err");
    }

    #[tokio::test]
    async fn test_feed_and_drain() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("copy");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("cat > {}", path.display()));
        let mut source: ByteStream = Box::new(std::io::Cursor::new(b"payload".to_vec()));
        let finished = feed(cmd, &mut source, &CancellationToken::new()).await.unwrap();
        assert!(finished.success());

        let copy_back = dir.path().join("copy-back");
        let mut cmd = Command::new("cat");
        cmd.arg(&path);
        let mut sink: ByteSink = Box::new(tokio::fs::File::create(&copy_back).await.unwrap());
        let finished = drain(cmd, &mut sink, &CancellationToken::new()).await.unwrap();
        assert!(finished.success());
        drop(sink);

        let out = std::fs::read(&copy_back).unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let result = output(cmd, &cancel).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_feed_child_that_ignores_stdin() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec 0<&-; exit 0");
        let mut source: ByteStream = Box::new(std::io::Cursor::new(vec![0u8; 16 * 1024 * 1024]));
        let result = feed(cmd, &mut source, &CancellationToken::new()).await;
        assert!(matches!(result, Err(BackupError::Transport(_))));
    }

    #[tokio::test]
    async fn test_feed_source_failure_kills_child() {
        struct Failing;
        impl tokio::io::AsyncRead for Failing {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("export failed")))
            }
        }

        let mut source: ByteStream = Box::new(Failing);
        match feed(Command::new("cat"), &mut source, &CancellationToken::new()).await {
            Err(BackupError::Transport(msg)) => assert!(msg.contains("export failed")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
