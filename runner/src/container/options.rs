use crate::config::DockerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PullPolicy::Always => "ALWAYS",
            PullPolicy::IfNotPresent => "IF_NOT_PRESENT",
            PullPolicy::Never => "NEVER",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Vec<String>>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub server_address: Option<String>,
}

/// Per-request container settings. Unset fields are filled from the
/// deployment configuration by [`ContainerOptions::apply_defaults`].
///
/// Sizes are human strings such as `512Mi`, `1g` or plain bytes; `cpus` is a
/// fractional CPU count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOptions {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub pull_policy: Option<PullPolicy>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub memory_swap: Option<String>,
    #[serde(default)]
    pub memory_swappiness: Option<i64>,
    #[serde(default)]
    pub memory_reservation: Option<String>,
    #[serde(default)]
    pub kernel_memory: Option<String>,
    #[serde(default)]
    pub oom_kill_disable: Option<bool>,
    #[serde(default)]
    pub shm_size: Option<String>,
    /// `host:container[:mode]` binds, honored only when volumes are enabled
    /// deployment-wide.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    /// `None` clears the image entrypoint so the interpreter argv runs as is.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub device_requests: Vec<DeviceRequest>,
    #[serde(default)]
    pub credentials: Option<RegistryCredentials>,
}

impl ContainerOptions {
    /// Fill unset image and pull policy from the deployment configuration.
    pub fn apply_defaults(mut self, defaults: &DockerConfig) -> Self {
        if self.image.as_deref().map_or(true, |image| image.trim().is_empty()) {
            self.image = Some(defaults.default_image.clone());
        }
        if self.pull_policy.is_none() {
            self.pull_policy = Some(defaults.pull_policy);
        }
        self
    }

    pub fn pull_policy(&self) -> PullPolicy {
        self.pull_policy.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_defaults_fills_only_unset_fields() {
        let defaults = DockerConfig {
            default_image: "ubuntu:latest".into(),
            pull_policy: PullPolicy::Always,
            ..DockerConfig::default()
        };

        let filled = ContainerOptions::default().apply_defaults(&defaults);
        assert_eq!(filled.image.as_deref(), Some("ubuntu:latest"));
        assert_eq!(filled.pull_policy(), PullPolicy::Always);

        let explicit = ContainerOptions {
            image: Some("alpine:3.19".into()),
            pull_policy: Some(PullPolicy::Never),
            ..Default::default()
        }
        .apply_defaults(&defaults);
        assert_eq!(explicit.image.as_deref(), Some("alpine:3.19"));
        assert_eq!(explicit.pull_policy(), PullPolicy::Never);
    }

    #[test]
    fn deserializes_camel_case_options() {
        let options: ContainerOptions = serde_json::from_str(
            r#"{"image":"python:3.12","pullPolicy":"ALWAYS","memory":"512Mi","cpus":1.5,
                "deviceRequests":[{"driver":"nvidia","count":-1,"capabilities":[["gpu"]]}]}"#,
        )
        .unwrap();

        assert_eq!(options.pull_policy(), PullPolicy::Always);
        assert_eq!(options.memory.as_deref(), Some("512Mi"));
        assert_eq!(options.device_requests[0].capabilities, vec![vec!["gpu"]]);
    }
}
