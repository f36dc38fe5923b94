//! Runs an execution as a child process of the runner.

mod tree;

pub use tree::kill_tree;

use crate::error::RunnerError;
use crate::logs::{decode_line, LogConsumer, StreamKind};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How long readers may keep draining after the process tree was killed.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct LocalCommand<'a> {
    pub argv: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub working_dir: &'a Path,
}

/// Spawn the command and feed both of its streams to `consumer`.
///
/// Returns the exit code once the process exited and both streams ended.
/// A non-zero exit becomes [`RunnerError::NonZeroExit`]; cancellation kills
/// the whole process tree and returns [`RunnerError::Cancelled`].
#[instrument(level = "info", skip_all, fields(execution_id = %consumer.execution_id()))]
pub async fn run(
    command: LocalCommand<'_>,
    consumer: Arc<LogConsumer>,
    cancel: &CancellationToken,
) -> Result<i64, RunnerError> {
    let (program, args) = command
        .argv
        .split_first()
        .ok_or_else(|| RunnerError::validation("Command line is empty"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(command.env)
        .current_dir(command.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    info!(pid, program = %program, "Started local process");

    let stdout = child.stdout.take().ok_or_else(|| RunnerError::Io {
        message: "Child stdout was not captured".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| RunnerError::Io {
        message: "Child stderr was not captured".to_string(),
    })?;

    let stdout_task = tokio::spawn(pump(stdout, Arc::clone(&consumer), StreamKind::Stdout));
    let stderr_task = tokio::spawn(pump(stderr, Arc::clone(&consumer), StreamKind::Stderr));
    let aborts = [stdout_task.abort_handle(), stderr_task.abort_handle()];
    let readers = futures_util::future::join(stdout_task, stderr_task);
    tokio::pin!(readers);

    let status = tokio::select! {
        status = child.wait() => status
            .map_err(|err| RunnerError::io("Failed to wait for local process", err))?,
        _ = cancel.cancelled() => {
            terminate(&mut child, pid).await;
            drain(&mut readers, &aborts).await;
            return Err(RunnerError::Cancelled { captured: consumer.snapshot() });
        }
    };

    // Exit can race ahead of the last buffered lines; the result is only final
    // once both streams reported end of file.
    let (stdout_done, stderr_done) = tokio::select! {
        streams = &mut readers => streams,
        _ = cancel.cancelled() => {
            terminate(&mut child, pid).await;
            drain(&mut readers, &aborts).await;
            return Err(RunnerError::Cancelled { captured: consumer.snapshot() });
        }
    };

    if let Some(message) = reader_failure(StreamKind::Stdout, stdout_done)
        .or_else(|| reader_failure(StreamKind::Stderr, stderr_done))
    {
        return Err(RunnerError::Streaming {
            message,
            captured: consumer.snapshot(),
        });
    }

    let exit_code = exit_code(status);
    let captured = consumer.snapshot();
    info!(
        exit_code,
        stdout_lines = captured.stdout_lines,
        stderr_lines = captured.stderr_lines,
        "Local process finished"
    );

    if exit_code != 0 {
        return Err(RunnerError::non_zero_exit(exit_code, &captured));
    }
    Ok(exit_code)
}

async fn pump<R>(reader: R, consumer: Arc<LogConsumer>, stream: StreamKind) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        consumer.accept(&decode_line(&buf), stream);
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    warn!(pid, "Cancelling local process");
    if let Some(pid) = pid {
        kill_tree(pid);
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "Parent process already gone");
    }
}

async fn drain<F>(readers: &mut F, aborts: &[AbortHandle])
where
    F: Future + Unpin,
{
    if tokio::time::timeout(READER_GRACE, readers).await.is_err() {
        warn!("Output readers did not finish after kill; abandoning them");
        for handle in aborts {
            handle.abort();
        }
    }
}

fn reader_failure(
    stream: StreamKind,
    result: Result<std::io::Result<()>, JoinError>,
) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("failed reading {}: {}", stream, err)),
        Err(err) => Some(format!("{} reader task failed: {}", stream, err)),
    }
}

/// Exit code, or `128 + signal` for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    -1
}
