use crate::config::RunnerConfig;
use crate::container::{ContainerBackend, ContainerEngine, ContainerSpec, DockerEngine};
use crate::error::RunnerError;
use crate::local::{self, LocalCommand};
use crate::logs::{LogConsumer, LogSink, TracingLogSink};
use crate::request::{ExecutionRequest, RunnerResult};
use crate::staging::FileStaging;
use crate::storage::Storage;
use crate::telemetry::RunnerMetrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Where an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Local,
    Container,
}

impl RunnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Container => "container",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single entry point for running executions.
pub struct ScriptRunner {
    config: RunnerConfig,
    storage: Arc<dyn Storage>,
    engine: OnceCell<Arc<dyn ContainerEngine>>,
    sink: Arc<dyn LogSink>,
}

impl ScriptRunner {
    pub fn new(config: RunnerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            engine: OnceCell::new(),
            sink: Arc::new(TracingLogSink),
        }
    }

    /// Use `engine` instead of connecting to the configured daemon.
    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = OnceCell::new_with(Some(engine));
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `request` on the backend selected by `kind`.
    ///
    /// Outputs are collected only when the script exited with code 0.
    #[instrument(
        level = "info",
        skip_all,
        fields(execution_id = %request.execution_id, runner = %kind)
    )]
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        kind: RunnerKind,
        cancel: CancellationToken,
    ) -> Result<RunnerResult, RunnerError> {
        let started_at = Utc::now();
        let started = Instant::now();

        request.validate()?;
        let container_spec = match kind {
            RunnerKind::Local => None,
            RunnerKind::Container => {
                let options = request.container.clone().apply_defaults(&self.config.docker);
                let spec =
                    ContainerSpec::build(request, &options, self.config.docker.volumes_enabled)?;
                Some((spec, options))
            }
        };

        let output_dir = request.output_dir();
        create_dir(&request.working_dir).await?;
        create_dir(&output_dir).await?;

        let staging = FileStaging::new(
            &request.working_dir,
            &output_dir,
            Arc::clone(&self.storage),
            &request.execution_id,
        );
        staging.stage_inputs(&request.input_files).await?;

        let consumer = Arc::new(LogConsumer::new(
            request.execution_id.clone(),
            Arc::clone(&self.sink),
        ));

        let outcome = match &container_spec {
            None => {
                let argv = request.argv();
                let env = request.effective_env();
                let command = LocalCommand {
                    argv: &argv,
                    env: &env,
                    working_dir: &request.working_dir,
                };
                local::run(command, Arc::clone(&consumer), &cancel).await
            }
            Some((spec, options)) => {
                let engine = self.engine().await?;
                let backend =
                    ContainerBackend::new(engine, self.config.docker.pull_retry.policy());
                backend
                    .run(
                        spec,
                        options.pull_policy(),
                        options.credentials.as_ref(),
                        Arc::clone(&consumer),
                        &cancel,
                    )
                    .await
            }
        };
        RunnerMetrics::record_execution(kind.as_str(), &outcome, started.elapsed());
        let exit_code = outcome?;

        let output_files = staging
            .collect_outputs(
                &request.output_files,
                &request.output_dirs,
                &request.render_vars(),
            )
            .await?;

        let captured = consumer.snapshot();
        RunnerMetrics::record_script_metrics(&captured.metrics);
        let warning = request.warn_on_stderr && captured.stderr_lines > 0;
        if warning {
            info!(
                stderr_lines = captured.stderr_lines,
                "Execution succeeded with output on stderr"
            );
        }

        Ok(RunnerResult {
            execution_id: request.execution_id.clone(),
            exit_code,
            stdout_lines: captured.stdout_lines,
            stderr_lines: captured.stderr_lines,
            outputs: captured.outputs,
            metrics: captured.metrics,
            output_files,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            warning,
        })
    }

    async fn engine(&self) -> Result<Arc<dyn ContainerEngine>, RunnerError> {
        self.engine
            .get_or_try_init(|| async {
                let engine = DockerEngine::connect(&self.config.docker)?;
                Ok::<Arc<dyn ContainerEngine>, RunnerError>(Arc::new(engine))
            })
            .await
            .map(Arc::clone)
    }
}

async fn create_dir(path: &Path) -> Result<(), RunnerError> {
    fs::create_dir_all(path)
        .await
        .map_err(|err| RunnerError::io(format!("Failed to create {}", path.display()), err))
}
