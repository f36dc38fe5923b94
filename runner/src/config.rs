//! Deployment-wide runner settings.

use crate::container::image::RetryPolicy;
use crate::container::options::PullPolicy;
use crate::dispatch::RunnerKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Config name used to locate `<name>.json` and its schema.
pub const CONFIG_NAME: &str = "script-runner";

pub const DOCKER_HOST_ENV: &str = "SCRIPT_RUNNER_DOCKER_HOST";
pub const VOLUMES_ENABLED_ENV: &str = "SCRIPT_RUNNER_VOLUMES_ENABLED";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub default_runner: RunnerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    /// `unix://`, `tcp://` or `http://` endpoint. Discovered when unset.
    #[serde(default)]
    pub host: Option<String>,
    /// Extra host binds requested per execution are ignored unless set.
    #[serde(default)]
    pub volumes_enabled: bool,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default = "default_image")]
    pub default_image: String,
    #[serde(default)]
    pub pull_retry: PullRetryConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            volumes_enabled: false,
            pull_policy: PullPolicy::default(),
            default_image: default_image(),
            pull_retry: PullRetryConfig::default(),
        }
    }
}

fn default_image() -> String {
    "ubuntu:latest".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PullRetryConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PullRetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 5_000,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl PullRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".script-runner/storage")
}

impl RunnerConfig {
    /// Apply `SCRIPT_RUNNER_*` environment overrides on top of loaded values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(DOCKER_HOST_ENV) {
            if !host.trim().is_empty() {
                self.docker.host = Some(host);
            }
        }
        if let Ok(raw) = std::env::var(VOLUMES_ENABLED_ENV) {
            match parse_flag(&raw) {
                Some(enabled) => self.docker.volumes_enabled = enabled,
                None => warn!(value = %raw, "Ignoring unrecognized {}", VOLUMES_ENABLED_ENV),
            }
        }
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
