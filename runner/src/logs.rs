use crate::protocol::{self, MetricEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-visible destination for script output, one line at a time.
pub trait LogSink: Send + Sync {
    fn line(&self, execution_id: &str, stream: StreamKind, line: &str);
}

/// Forwards lines to `tracing`: stdout at INFO, stderr at WARN.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn line(&self, execution_id: &str, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => {
                info!(target: "script_runner::output", execution_id, "{}", line)
            }
            StreamKind::Stderr => {
                warn!(target: "script_runner::output", execution_id, "{}", line)
            }
        }
    }
}

/// What an execution printed, frozen after both streams ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedOutput {
    pub stdout_lines: usize,
    pub stderr_lines: usize,
    pub outputs: BTreeMap<String, Value>,
    pub metrics: Vec<MetricEvent>,
}

/// Per-execution consumer shared by the stdout and stderr readers.
pub struct LogConsumer {
    execution_id: String,
    sink: Arc<dyn LogSink>,
    stdout_lines: AtomicUsize,
    stderr_lines: AtomicUsize,
    outputs: Mutex<BTreeMap<String, Value>>,
    metrics: Mutex<Vec<MetricEvent>>,
}

impl LogConsumer {
    pub fn new(execution_id: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            execution_id: execution_id.into(),
            sink,
            stdout_lines: AtomicUsize::new(0),
            stderr_lines: AtomicUsize::new(0),
            outputs: Mutex::new(BTreeMap::new()),
            metrics: Mutex::new(Vec::new()),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Handle one complete line from `stream`.
    pub fn accept(&self, line: &str, stream: StreamKind) {
        match stream {
            StreamKind::Stdout => self.stdout_lines.fetch_add(1, Ordering::SeqCst),
            StreamKind::Stderr => self.stderr_lines.fetch_add(1, Ordering::SeqCst),
        };

        let frame = protocol::parse_line(line);
        if !frame.outputs.is_empty() {
            let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
            outputs.extend(frame.outputs);
        }
        if !frame.metrics.is_empty() {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            metrics.extend(frame.metrics);
        }

        self.sink.line(&self.execution_id, stream, line);
    }

    pub fn stdout_lines(&self) -> usize {
        self.stdout_lines.load(Ordering::SeqCst)
    }

    pub fn stderr_lines(&self) -> usize {
        self.stderr_lines.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            stdout_lines: self.stdout_lines(),
            stderr_lines: self.stderr_lines(),
            outputs: self
                .outputs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            metrics: self
                .metrics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

impl fmt::Debug for LogConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConsumer")
            .field("execution_id", &self.execution_id)
            .field("stdout_lines", &self.stdout_lines())
            .field("stderr_lines", &self.stderr_lines())
            .finish()
    }
}

/// Turn raw bytes read up to a newline into a line: lossy UTF-8, without the
/// trailing `\n` or `\r\n`.
pub(crate) fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    if end > 0 && bytes[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && bytes[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
