//! Bounded command execution with retry.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::{ExecError, ExecResult};
use crate::lines::LossyLines;
use crate::process_tree::{isolate_process_group, kill_process_tree};
use crate::spec::CommandSpec;

/// How long output readers may keep draining after the child is gone.
///
/// A helper that escaped the process group can hold the pipes open forever.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run `spec` to completion, retrying failed attempts.
///
/// Returns captured stdout of the first successful attempt, or the error of
/// the last attempt once `spec.retries()` attempts have failed.
#[instrument(skip_all, fields(command = %spec.display()))]
pub async fn run(spec: &CommandSpec) -> ExecResult<String> {
    let attempts = spec.retries();
    let mut attempt = 1;

    loop {
        match run_once(spec).await {
            Ok(output) => {
                if attempt > 1 {
                    debug!(attempt, "command succeeded after retry");
                }
                return Ok(output);
            }
            Err(err) if err.is_config() || attempt >= attempts => return Err(err),
            Err(err) => {
                warn!(
                    attempt,
                    attempts,
                    error = %err,
                    delay_ms = spec.retry_delay().as_millis() as u64,
                    "command failed, retrying"
                );
                tokio::time::sleep(spec.retry_delay()).await;
                attempt += 1;
            }
        }
    }
}

/// A single attempt: spawn, race the timeout, collect output.
async fn run_once(spec: &CommandSpec) -> ExecResult<String> {
    let (program, argv) = spec.invocation();
    let started = Instant::now();

    let mut command = Command::new(&program);
    command
        .args(&argv)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.work_dir {
        command.current_dir(dir);
    }
    isolate_process_group(&mut command);

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pgid = child.id();
    debug!(pid = ?pgid, shell = %spec.shell(), "command started");

    let stdout = child
        .stdout
        .take()
        .map(|stream| tokio::spawn(drain(stream, spec.tap.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|stream| tokio::spawn(drain(stream, spec.tap.clone())));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(spec.timeout()) => None,
    };

    let Some(status) = waited else {
        if !spec.force_kill() {
            warn!(
                timeout_ms = spec.timeout().as_millis() as u64,
                "command timed out, leaving it running"
            );
            return Err(ExecError::TimedOut {
                command: spec.display(),
                timeout: spec.timeout(),
            });
        }

        let killed = kill_timed_out(&mut child, pgid, kill_process_tree).await;
        let _ = collect(stdout).await;
        let _ = collect(stderr).await;
        killed?;
        warn!(
            timeout_ms = spec.timeout().as_millis() as u64,
            "command timed out, process group killed"
        );
        return Err(ExecError::TimedOutKilled {
            command: spec.display(),
            timeout: spec.timeout(),
        });
    };

    let status = status.map_err(|source| ExecError::Wait {
        program: program.clone(),
        source,
    })?;
    let out = collect(stdout).await;
    let err = collect(stderr).await;
    debug!(
        status = %status,
        duration_ms = started.elapsed().as_millis() as u64,
        "command exited"
    );

    if status.success() {
        return Ok(out);
    }

    let output = join_output(&out, &err);
    let message = if err.trim().is_empty() {
        output.clone()
    } else {
        err.trim_end().to_string()
    };
    Err(ExecError::Failed {
        command: spec.display(),
        status: status.to_string(),
        message,
        output,
    })
}

/// Kill a timed-out child's process group with `kill` and reap the child.
///
/// If the group cannot be signalled, only the direct child is killed; it is
/// reaped either way before the kill error is returned.
async fn kill_timed_out<K>(child: &mut Child, pgid: Option<u32>, kill: K) -> ExecResult<()>
where
    K: FnOnce(u32) -> io::Result<()>,
{
    let killed = match pgid {
        Some(pgid) => kill(pgid).map_err(|source| ExecError::Kill { pgid, source }),
        None => Ok(()),
    };
    if let Err(err) = &killed {
        warn!(error = %err, "killing the direct child only");
        child.start_kill().ok();
    }
    // Reap the direct child; the rest of the group is gone with it.
    let _ = child.wait().await;
    killed
}

/// Read `stream` line by line, forwarding each line to `tap`.
async fn drain<R>(stream: R, tap: Option<UnboundedSender<String>>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = LossyLines::new(BufReader::new(stream));
    let mut captured = Vec::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(tap) = &tap {
                    // A dropped receiver only means nobody is watching.
                    let _ = tap.send(line.clone());
                }
                captured.push(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "stopped reading command output");
                break;
            }
        }
    }
    captured.join("\n")
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    let Some(handle) = reader else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            debug!(error = %err, "output reader task failed");
            String::new()
        }
        Err(_) => {
            abort.abort();
            debug!("output still open after child exit, dropping it");
            String::new()
        }
    }
}

fn join_output(out: &str, err: &str) -> String {
    match (out.is_empty(), err.is_empty()) {
        (true, _) => err.to_string(),
        (_, true) => out.to_string(),
        _ => format!("{out}\n{err}"),
    }
}
