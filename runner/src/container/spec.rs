use super::limits::ResourceLimits;
use super::options::{ContainerOptions, DeviceRequest};
use crate::error::RunnerError;
use crate::request::ExecutionRequest;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

pub const EXECUTION_ID_LABEL: &str = "script-runner.io/execution-id";

/// Everything needed to create the container for one execution, already
/// validated and translated into engine units.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub working_dir: String,
    pub binds: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub user: Option<String>,
    pub network_mode: Option<String>,
    pub extra_hosts: Vec<String>,
    pub limits: ResourceLimits,
    pub device_requests: Vec<DeviceRequest>,
}

impl ContainerSpec {
    /// `options` should already carry deployment defaults.
    pub fn build(
        request: &ExecutionRequest,
        options: &ContainerOptions,
        volumes_enabled: bool,
    ) -> Result<Self, RunnerError> {
        let image = options
            .image
            .as_deref()
            .map(str::trim)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| RunnerError::validation("Container image is required"))?
            .to_string();

        let working_dir = request
            .working_dir
            .to_str()
            .ok_or_else(|| {
                RunnerError::validation(format!(
                    "Working directory '{}' is not valid UTF-8",
                    request.working_dir.display()
                ))
            })?
            .to_string();

        // Same path inside and outside so path-valued variables stay valid.
        let mut binds = vec![format!("{}:{}", working_dir, working_dir)];
        if !options.volumes.is_empty() {
            if volumes_enabled {
                for volume in &options.volumes {
                    validate_bind(volume)?;
                    binds.push(volume.clone());
                }
            } else {
                warn!(
                    count = options.volumes.len(),
                    "Volumes are disabled for this deployment; ignoring requested binds"
                );
            }
        }

        let limits = ResourceLimits::from_options(options)?;

        let env = request
            .effective_env()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut labels = request.labels.clone();
        labels.insert(
            EXECUTION_ID_LABEL.to_string(),
            request.execution_id.clone(),
        );

        Ok(Self {
            name: format!("script-runner-{}", Uuid::new_v4().simple()),
            image,
            entrypoint: options
                .entrypoint
                .clone()
                .unwrap_or_else(|| vec![String::new()]),
            cmd: request.argv(),
            env,
            working_dir,
            binds,
            labels,
            user: options.user.clone(),
            network_mode: options.network_mode.clone(),
            extra_hosts: options.extra_hosts.clone(),
            limits,
            device_requests: options.device_requests.clone(),
        })
    }
}

fn validate_bind(volume: &str) -> Result<(), RunnerError> {
    let mut parts = volume.split(':');
    let host = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    if host.is_empty() || !target.starts_with('/') || parts.count() > 1 {
        return Err(RunnerError::validation(format!(
            "Invalid volume '{}', expected host:container[:mode]",
            volume
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        let mut request = ExecutionRequest::new("/work/exec-9", vec!["echo hi".into()]);
        request.env.insert("GREETING".into(), "hello".into());
        request.labels.insert("flow".into(), "nightly".into());
        request
    }

    fn options() -> ContainerOptions {
        ContainerOptions {
            image: Some("alpine:3.19".into()),
            volumes: vec!["/data:/data:ro".into()],
            ..Default::default()
        }
    }

    #[test]
    fn binds_working_dir_at_identical_path() {
        let spec = ContainerSpec::build(&request(), &options(), false).unwrap();

        assert_eq!(spec.working_dir, "/work/exec-9");
        assert_eq!(spec.binds, vec!["/work/exec-9:/work/exec-9".to_string()]);
        assert_eq!(spec.cmd, vec!["/bin/sh", "-c", "set -e\necho hi"]);
        assert_eq!(spec.entrypoint, vec![String::new()]);
        assert!(spec.env.contains(&"GREETING=hello".to_string()));
        assert!(spec.env.contains(&"WORKING_DIR=/work/exec-9".to_string()));
        assert_eq!(spec.labels.get("flow").map(String::as_str), Some("nightly"));
        assert!(spec.labels.contains_key(EXECUTION_ID_LABEL));
        assert!(spec.name.starts_with("script-runner-"));
    }

    #[test]
    fn extra_volumes_require_the_deployment_switch() {
        let disabled = ContainerSpec::build(&request(), &options(), false).unwrap();
        assert_eq!(disabled.binds.len(), 1);

        let enabled = ContainerSpec::build(&request(), &options(), true).unwrap();
        assert_eq!(
            enabled.binds,
            vec![
                "/work/exec-9:/work/exec-9".to_string(),
                "/data:/data:ro".to_string()
            ]
        );

        let malformed = ContainerOptions {
            volumes: vec!["just-a-name".into()],
            ..options()
        };
        assert!(ContainerSpec::build(&request(), &malformed, true).is_err());
    }

    #[test]
    fn image_is_required() {
        let missing = ContainerOptions {
            image: Some("  ".into()),
            ..Default::default()
        };
        let err = ContainerSpec::build(&request(), &missing, false).unwrap_err();
        assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST");
    }
}
