//! Script execution runner.
//!
//! Runs an ordered list of shell commands either as a local process or inside
//! an ephemeral container, counts and parses what the commands print, stages
//! input and output files through durable storage, and returns a uniform
//! [`RunnerResult`] or a typed [`RunnerError`].

pub mod config;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod local;
pub mod logs;
pub mod protocol;
pub mod request;
pub mod staging;
pub mod storage;
pub mod telemetry;

pub use config::RunnerConfig;
pub use container::options::{ContainerOptions, PullPolicy};
pub use dispatch::{RunnerKind, ScriptRunner};
pub use error::{CapturedOutput, RunnerError};
pub use logs::{LogConsumer, LogSink, StreamKind, TracingLogSink};
pub use protocol::{MetricEvent, MetricKind, ProtocolFrame};
pub use request::{ExecutionRequest, RunnerResult};
pub use storage::{LocalStorage, Storage, StorageError};
pub use tokio_util::sync::CancellationToken;
