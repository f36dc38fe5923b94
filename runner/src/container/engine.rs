use super::options::RegistryCredentials;
use super::spec::ContainerSpec;
use crate::logs::StreamKind;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("engine connection failed: {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Server-side (5xx) failures and dropped connections are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Server { status, .. } => *status >= 500,
            EngineError::Connection(_) => true,
            EngineError::Other(_) => false,
        }
    }
}

/// One chunk of container output. Not aligned to lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

pub type LogStream = BoxStream<'static, Result<LogFrame, EngineError>>;

/// The container engine operations an execution needs.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError>;

    /// Returns the container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Follow stdout and stderr until the container exits.
    fn logs(&self, id: &str) -> LogStream;

    /// Block until the container stops and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    async fn is_running(&self, id: &str) -> Result<bool, EngineError>;

    async fn kill_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}
