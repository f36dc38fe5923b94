use crate::container::options::ContainerOptions;
use crate::error::RunnerError;
use crate::protocol::MetricEvent;
use crate::staging::sanitize_relative;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, PathBuf};
use uuid::Uuid;

pub const WORKING_DIR_ENV: &str = "WORKING_DIR";
pub const OUTPUT_DIR_ENV: &str = "OUTPUT_DIR";

const DEFAULT_OUTPUT_SUBDIR: &str = "outputs";

/// One bounded unit of work: a list of already rendered commands and the
/// environment they run in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default = "new_execution_id")]
    pub execution_id: String,
    pub working_dir: PathBuf,
    /// Defaults to `<working_dir>/outputs`. Relative values are taken from the
    /// working directory.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub commands: Vec<String>,
    /// Program and leading arguments the joined script is appended to. Empty
    /// means the commands themselves are the argv.
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
    #[serde(default = "default_true")]
    pub exit_on_failed: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub container: ContainerOptions,
    /// Only used to render output paths.
    #[serde(default)]
    pub additional_vars: BTreeMap<String, String>,
    /// Relative name to literal content or `storage://` handle.
    #[serde(default)]
    pub input_files: BTreeMap<String, String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub output_dirs: Vec<String>,
    #[serde(default = "default_true")]
    pub warn_on_stderr: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn new_execution_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_interpreter() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

fn default_true() -> bool {
    true
}

impl ExecutionRequest {
    pub fn new(working_dir: impl Into<PathBuf>, commands: Vec<String>) -> Self {
        Self {
            execution_id: new_execution_id(),
            working_dir: working_dir.into(),
            output_dir: None,
            commands,
            interpreter: default_interpreter(),
            exit_on_failed: true,
            env: BTreeMap::new(),
            container: ContainerOptions::default(),
            additional_vars: BTreeMap::new(),
            input_files: BTreeMap::new(),
            output_files: Vec::new(),
            output_dirs: Vec::new(),
            warn_on_stderr: true,
            labels: BTreeMap::new(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.join(DEFAULT_OUTPUT_SUBDIR),
        }
    }

    /// Checks that need no I/O. Runs before anything touches the disk.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.commands.is_empty() {
            return Err(RunnerError::validation("Command list cannot be empty"));
        }

        if !self.working_dir.is_absolute() {
            return Err(RunnerError::validation(format!(
                "Working directory '{}' must be an absolute path",
                self.working_dir.display()
            )));
        }

        let output_dir = self.output_dir();
        let escapes = output_dir
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || output_dir == self.working_dir || !output_dir.starts_with(&self.working_dir) {
            return Err(RunnerError::validation(format!(
                "Output directory '{}' must be a subdirectory of the working directory",
                output_dir.display()
            )));
        }

        if let Some(key) = self
            .env
            .keys()
            .find(|key| key.is_empty() || key.contains('='))
        {
            return Err(RunnerError::validation(format!(
                "Invalid environment variable name '{}'",
                key
            )));
        }

        for name in self.input_files.keys() {
            sanitize_relative(name)?;
        }

        Ok(())
    }

    /// Commands joined into one script, fail-fast unless disabled.
    pub fn script(&self) -> String {
        let body = self.commands.join("\n");
        if self.exit_on_failed {
            format!("set -e\n{}", body)
        } else {
            body
        }
    }

    pub fn argv(&self) -> Vec<String> {
        if self.interpreter.is_empty() {
            return self.commands.clone();
        }
        let mut argv = self.interpreter.clone();
        argv.push(self.script());
        argv
    }

    /// Caller environment plus `WORKING_DIR` / `OUTPUT_DIR` unless overridden.
    pub fn effective_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.entry(WORKING_DIR_ENV.to_string())
            .or_insert_with(|| self.working_dir.display().to_string());
        env.entry(OUTPUT_DIR_ENV.to_string())
            .or_insert_with(|| self.output_dir().display().to_string());
        env
    }

    /// Variables available to output path expressions.
    pub fn render_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.additional_vars.clone();
        vars.insert(
            "workingDir".to_string(),
            self.working_dir.display().to_string(),
        );
        vars.insert(
            "outputDir".to_string(),
            self.output_dir().display().to_string(),
        );
        vars
    }
}

/// Outcome of an execution that exited with code 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerResult {
    pub execution_id: String,
    pub exit_code: i64,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
    pub outputs: BTreeMap<String, Value>,
    pub metrics: Vec<MetricEvent>,
    pub output_files: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Stderr produced lines and the request asked to be warned about it.
    pub warning: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("/work/exec-1", vec!["echo a".into(), "echo b".into()])
    }

    #[test]
    fn deserializes_with_defaults() {
        let request: ExecutionRequest = serde_json::from_str(
            r#"{"workingDir":"/work/x","commands":["true"],"env":{"A":"1"}}"#,
        )
        .unwrap();

        assert!(!request.execution_id.is_empty());
        assert_eq!(request.interpreter, vec!["/bin/sh", "-c"]);
        assert!(request.exit_on_failed);
        assert!(request.warn_on_stderr);
        assert_eq!(request.output_dir(), PathBuf::from("/work/x/outputs"));
    }

    #[test]
    fn argv_appends_script_to_interpreter() {
        let argv = request().argv();
        assert_eq!(argv, vec!["/bin/sh", "-c", "set -e\necho a\necho b"]);

        let mut verbatim = request();
        verbatim.interpreter.clear();
        assert_eq!(verbatim.argv(), vec!["echo a", "echo b"]);

        let mut lenient = request();
        lenient.exit_on_failed = false;
        assert_eq!(lenient.script(), "echo a\necho b");
    }

    #[test]
    fn validate_rejects_empty_commands_and_relative_dirs() {
        let mut empty = request();
        empty.commands.clear();
        assert_eq!(
            empty.validate().unwrap_err().code(),
            "SCRIPT_RUNNER_INVALID_REQUEST"
        );

        let relative = ExecutionRequest::new("work", vec!["true".into()]);
        assert!(relative.validate().is_err());

        let mut outside = request();
        outside.output_dir = Some(PathBuf::from("/elsewhere"));
        assert!(outside.validate().is_err());

        let mut sneaky = request();
        sneaky.output_dir = Some(PathBuf::from("../up"));
        assert!(sneaky.validate().is_err());

        let mut traversal = request();
        traversal
            .input_files
            .insert("../escape.txt".into(), "x".into());
        assert!(traversal.validate().is_err());

        assert!(request().validate().is_ok());
    }

    #[test]
    fn effective_env_exposes_directories_without_overriding_caller() {
        let mut request = request();
        request.env.insert("OUTPUT_DIR".into(), "/custom".into());

        let env = request.effective_env();
        assert_eq!(env.get("WORKING_DIR").unwrap(), "/work/exec-1");
        assert_eq!(env.get("OUTPUT_DIR").unwrap(), "/custom");
    }

    #[test]
    fn render_vars_include_directories() {
        let mut request = request();
        request.additional_vars.insert("day".into(), "mon".into());

        let vars = request.render_vars();
        assert_eq!(vars.get("day").unwrap(), "mon");
        assert_eq!(vars.get("outputDir").unwrap(), "/work/exec-1/outputs");
    }
}
