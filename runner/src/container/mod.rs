//! Runs an execution inside a fresh container.
//!
//! Lifecycle: resolve image, create, start, stream logs while waiting for
//! exit, tear down. Teardown runs exactly once for every created container,
//! whatever happened in between.

pub mod docker;
pub mod engine;
pub mod image;
pub mod limits;
pub mod lines;
pub mod options;
pub mod spec;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, EngineError, LogFrame, LogStream};
pub use image::RetryPolicy;
pub use spec::ContainerSpec;

use crate::error::RunnerError;
use crate::logs::LogConsumer;
use futures_util::StreamExt;
use lines::LineAssembler;
use options::{PullPolicy, RegistryCredentials};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct ContainerBackend {
    engine: Arc<dyn ContainerEngine>,
    retry: RetryPolicy,
}

impl ContainerBackend {
    pub fn new(engine: Arc<dyn ContainerEngine>, retry: RetryPolicy) -> Self {
        Self { engine, retry }
    }

    #[instrument(
        level = "info",
        skip_all,
        fields(execution_id = %consumer.execution_id(), image = %spec.image)
    )]
    pub async fn run(
        &self,
        spec: &ContainerSpec,
        pull_policy: PullPolicy,
        credentials: Option<&RegistryCredentials>,
        consumer: Arc<LogConsumer>,
        cancel: &CancellationToken,
    ) -> Result<i64, RunnerError> {
        tokio::select! {
            pulled = image::ensure_image(
                self.engine.as_ref(),
                &spec.image,
                pull_policy,
                &self.retry,
                credentials,
            ) => pulled?,
            _ = cancel.cancelled() => {
                return Err(RunnerError::Cancelled { captured: consumer.snapshot() });
            }
        }

        let id = self
            .engine
            .create_container(spec)
            .await
            .map_err(|err| RunnerError::engine(format!("Failed to create container: {}", err)))?;
        info!(container_id = %id, name = %spec.name, "Created container");

        let outcome = self.drive(&id, &consumer, cancel).await;
        self.teardown(&id).await;

        let exit_code = outcome?;
        let captured = consumer.snapshot();
        info!(
            container_id = %id,
            exit_code,
            stdout_lines = captured.stdout_lines,
            stderr_lines = captured.stderr_lines,
            "Container finished"
        );
        if exit_code != 0 {
            return Err(RunnerError::non_zero_exit(exit_code, &captured));
        }
        Ok(exit_code)
    }

    /// Start the container and block until it exited and its logs ended.
    async fn drive(
        &self,
        id: &str,
        consumer: &LogConsumer,
        cancel: &CancellationToken,
    ) -> Result<i64, RunnerError> {
        self.engine
            .start_container(id)
            .await
            .map_err(|err| RunnerError::engine(format!("Failed to start container: {}", err)))?;

        let streaming = stream_logs(self.engine.logs(id), consumer);
        let waiting = self.engine.wait_container(id);

        tokio::select! {
            (streamed, waited) = async { tokio::join!(streaming, waiting) } => {
                if let Err(err) = streamed {
                    return Err(RunnerError::Streaming {
                        message: err.to_string(),
                        captured: consumer.snapshot(),
                    });
                }
                waited.map_err(|err| RunnerError::Streaming {
                    message: format!("Lost container while waiting: {}", err),
                    captured: consumer.snapshot(),
                })
            }
            _ = cancel.cancelled() => {
                warn!(container_id = %id, "Cancelling container execution");
                Err(RunnerError::Cancelled { captured: consumer.snapshot() })
            }
        }
    }

    /// Kill if still running, then remove. Failures are logged only.
    async fn teardown(&self, id: &str) {
        match self.engine.is_running(id).await {
            Ok(true) => {
                debug!(container_id = %id, "Container still running; killing");
                if let Err(err) = self.engine.kill_container(id).await {
                    warn!(container_id = %id, error = %err, "Failed to kill container");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(container_id = %id, error = %err, "Failed to inspect container before removal");
            }
        }

        match self.engine.remove_container(id).await {
            Ok(()) => debug!(container_id = %id, "Removed container"),
            Err(err) => warn!(container_id = %id, error = %err, "Failed to remove container"),
        }
    }
}

/// Feed every frame to the consumer as whole lines, flushing the partial tail
/// once the stream ends.
async fn stream_logs(mut frames: LogStream, consumer: &LogConsumer) -> Result<(), EngineError> {
    let mut lines = LineAssembler::new();
    let mut failure = None;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                for line in lines.push(frame.stream, &frame.bytes) {
                    consumer.accept(&line, frame.stream);
                }
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    for (stream, line) in lines.finish() {
        consumer.accept(&line, stream);
    }
    failure.map_or(Ok(()), Err)
}
