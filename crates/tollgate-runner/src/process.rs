//! Child process supervision shared by the shell and action runners.

use crate::runner::{OutputLine, OutputStream, StepResult};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tollgate_core::Result;
use tollgate_core::run::ExitSignal;
use tracing::{debug, warn};

/// Spawn `command`, stream its output and wait for it within `limit`.
///
/// A spawn failure is an infrastructure error; a timeout kills the child and
/// is reported as [`ExitSignal::Timeout`]. Output still open after the child
/// exits is drained only until `limit` runs out, and the child's own exit
/// status is reported either way.
pub(crate) async fn run_to_completion(
    mut command: Command,
    limit: Duration,
    output_tx: mpsc::Sender<OutputLine>,
) -> Result<StepResult> {
    let start = std::time::Instant::now();

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            tollgate_core::Error::Infrastructure(format!("Failed to spawn process: {}", e))
        })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        tollgate_core::Error::Infrastructure("Child stdout was not captured".to_string())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        tollgate_core::Error::Infrastructure("Child stderr was not captured".to_string())
    })?;

    let mut stdout_handle = tokio::spawn(stream_lines(
        stdout,
        OutputStream::Stdout,
        output_tx.clone(),
    ));
    let mut stderr_handle =
        tokio::spawn(stream_lines(stderr, OutputStream::Stderr, output_tx));

    let wait_result = match timeout(limit, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_secs = limit.as_secs(), "Command timed out, killing process");
            let _ = child.kill().await;
            stdout_handle.abort();
            stderr_handle.abort();
            return Ok(StepResult {
                exit: ExitSignal::Timeout,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    };

    // Background processes may keep the pipes open after the child exits.
    let remaining = limit.saturating_sub(start.elapsed());
    let drain = async {
        join_reader(&mut stdout_handle).await;
        join_reader(&mut stderr_handle).await;
    };
    if timeout(remaining, drain).await.is_err() {
        warn!("Output still open when the step limit expired, detaching readers");
        stdout_handle.abort();
        stderr_handle.abort();
    }

    let status = wait_result.map_err(|e| {
        tollgate_core::Error::Infrastructure(format!("Failed to wait for process: {}", e))
    })?;

    let exit = match status.code() {
        Some(code) => ExitSignal::Code(code),
        None => ExitSignal::Terminated,
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    debug!(%exit, duration_ms, "Command completed");

    Ok(StepResult { exit, duration_ms })
}

async fn join_reader(handle: &mut JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(error = %e, "Output reader failed");
    }
}

/// Forward output line by line until the pipe closes.
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream, and
/// the pipe keeps being drained after the receiver goes away so the child
/// never blocks or dies on a full or broken pipe.
async fn stream_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut line_num = 0u32;
    let mut forwarding = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        }
        if !forwarding {
            continue;
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        line_num += 1;
        let output = OutputLine {
            stream,
            content: String::from_utf8_lossy(&buf).into_owned(),
            line_number: line_num,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(output).await.is_err() {
            forwarding = false;
        }
    }
}
