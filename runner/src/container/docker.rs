//! [`ContainerEngine`] backed by a Docker-compatible daemon.

use super::engine::{ContainerEngine, EngineError, LogFrame, LogStream};
use super::options::RegistryCredentials;
use super::spec::ContainerSpec;
use crate::config::DockerConfig;
use crate::error::RunnerError;
use crate::logs::StreamKind;
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::future;
use futures_util::StreamExt;
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
/// Socket exposed by a docker-in-docker sidecar.
pub const DIND_SOCKET: &str = "/dind/docker.sock";

const CLIENT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Configured(String),
    Socket(String),
    LocalDefaults,
}

/// Configured host first, then the well-known sockets that exist, then the
/// client library defaults.
pub fn resolve_endpoint(configured: Option<&str>, socket_exists: impl Fn(&Path) -> bool) -> Endpoint {
    if let Some(host) = configured.map(str::trim).filter(|h| !h.is_empty()) {
        return Endpoint::Configured(host.to_string());
    }
    [DEFAULT_SOCKET, DIND_SOCKET]
        .into_iter()
        .find(|socket| socket_exists(Path::new(socket)))
        .map(|socket| Endpoint::Socket(socket.to_string()))
        .unwrap_or(Endpoint::LocalDefaults)
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(config: &DockerConfig) -> Result<Self, RunnerError> {
        let endpoint = resolve_endpoint(config.host.as_deref(), |path| path.exists());
        let connected = match &endpoint {
            Endpoint::Configured(host) if host.starts_with("unix://") || host.starts_with('/') => {
                Docker::connect_with_unix(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Endpoint::Configured(host) => {
                Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Endpoint::Socket(path) => {
                Docker::connect_with_unix(path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Endpoint::LocalDefaults => Docker::connect_with_local_defaults(),
        };
        let docker = connected.map_err(|err| {
            RunnerError::engine(format!(
                "Failed to connect to container engine at {:?}: {}",
                endpoint, err
            ))
        })?;
        info!(endpoint = ?endpoint, "Connected to container engine");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(engine_error(err)),
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let credentials = credentials.map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            serveraddress: c.server_address.clone(),
            ..Default::default()
        });

        let mut progress = Box::pin(self.docker.create_image(Some(options), None, credentials));
        while let Some(item) = progress.next().await {
            let info = item.map_err(engine_error)?;
            if let Some(error) = info.error {
                return Err(EngineError::Other(error));
            }
            if let Some(status) = info.status {
                debug!(image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(engine_error)?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_error)
    }

    fn logs(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .filter_map(|item| {
                future::ready(match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(LogFrame {
                            stream: StreamKind::Stdout,
                            bytes: message.to_vec(),
                        }))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogFrame {
                        stream: StreamKind::Stderr,
                        bytes: message.to_vec(),
                    })),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(err) => Some(Err(engine_error(err))),
                })
            })
            .boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut waiting = Box::pin(self.docker.wait_container(id, Some(options)));
        match waiting.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(engine_error(err)),
            None => Err(EngineError::Connection(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_container(id, None).await {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(engine_error(err)),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(engine_error)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(engine_error(err)),
        }
    }
}

pub(crate) fn container_config(spec: &ContainerSpec) -> Config<String> {
    Config {
        image: Some(spec.image.clone()),
        entrypoint: Some(spec.entrypoint.clone()),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        working_dir: Some(spec.working_dir.clone()),
        user: spec.user.clone(),
        labels: Some(spec.labels.clone().into_iter().collect()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(host_config(spec)),
        ..Default::default()
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let limits = &spec.limits;
    HostConfig {
        binds: Some(spec.binds.clone()),
        network_mode: spec.network_mode.clone(),
        extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
        nano_cpus: limits.nano_cpus,
        memory: limits.memory,
        memory_swap: limits.memory_swap,
        memory_swappiness: limits.memory_swappiness,
        memory_reservation: limits.memory_reservation,
        oom_kill_disable: limits.oom_kill_disable,
        shm_size: limits.shm_size,
        device_requests: (!spec.device_requests.is_empty()).then(|| {
            spec.device_requests
                .iter()
                .map(|request| DeviceRequest {
                    driver: request.driver.clone(),
                    count: request.count,
                    device_ids: (!request.device_ids.is_empty())
                        .then(|| request.device_ids.clone()),
                    capabilities: (!request.capabilities.is_empty())
                        .then(|| request.capabilities.clone()),
                    options: (!request.options.is_empty())
                        .then(|| request.options.clone().into_iter().collect()),
                })
                .collect()
        }),
        ..Default::default()
    }
}

fn engine_error(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Server {
            status: status_code,
            message,
        },
        BollardError::IOError { err } => EngineError::Connection(err.to_string()),
        BollardError::HyperResponseError { err } => EngineError::Connection(err.to_string()),
        BollardError::RequestTimeoutError => {
            EngineError::Connection("request timed out".to_string())
        }
        BollardError::SocketNotFoundError(path) => {
            EngineError::Connection(format!("socket not found: {}", path))
        }
        other => EngineError::Other(other.to_string()),
    }
}
