use crate::storage::StorageError;
use thiserror::Error;

pub use crate::logs::CapturedOutput;

/// Every way an execution can fail.
///
/// Variants raised after the script started carry what was captured so far;
/// a non-zero exit deliberately keeps only the counts.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid execution request: {message}")]
    Validation { message: String },
    #[error("Failed to pull image '{image}' after {attempts} attempt(s): {message}")]
    ImagePull {
        image: String,
        attempts: u32,
        message: String,
    },
    #[error("Container engine error: {message}")]
    Engine { message: String },
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error(
        "Script exited with code {exit_code} (stdout lines: {stdout_lines}, stderr lines: {stderr_lines})"
    )]
    NonZeroExit {
        exit_code: i64,
        stdout_lines: usize,
        stderr_lines: usize,
    },
    #[error("Output streaming failed: {message}")]
    Streaming {
        message: String,
        captured: CapturedOutput,
    },
    #[error("Execution cancelled")]
    Cancelled { captured: CapturedOutput },
    #[error("Storage error: {message}")]
    Storage { message: String },
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl RunnerError {
    pub fn validation(message: impl Into<String>) -> Self {
        RunnerError::Validation {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        RunnerError::Engine {
            message: message.into(),
        }
    }

    pub fn io(context: impl std::fmt::Display, source: std::io::Error) -> Self {
        RunnerError::Io {
            message: format!("{}: {}", context, source),
        }
    }

    pub(crate) fn non_zero_exit(exit_code: i64, captured: &CapturedOutput) -> Self {
        RunnerError::NonZeroExit {
            exit_code,
            stdout_lines: captured.stdout_lines,
            stderr_lines: captured.stderr_lines,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::Validation { .. } => "SCRIPT_RUNNER_INVALID_REQUEST",
            RunnerError::ImagePull { .. } => "SCRIPT_RUNNER_IMAGE_PULL",
            RunnerError::Engine { .. } => "SCRIPT_RUNNER_ENGINE",
            RunnerError::Spawn { .. } => "SCRIPT_RUNNER_SPAWN",
            RunnerError::NonZeroExit { .. } => "SCRIPT_RUNNER_NON_ZERO_EXIT",
            RunnerError::Streaming { .. } => "SCRIPT_RUNNER_STREAMING",
            RunnerError::Cancelled { .. } => "SCRIPT_RUNNER_CANCELLED",
            RunnerError::Storage { .. } => "SCRIPT_RUNNER_STORAGE",
            RunnerError::Io { .. } => "SCRIPT_RUNNER_IO",
        }
    }

    /// Exit code of the script, when it ran to completion.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            RunnerError::NonZeroExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// `(stdout_lines, stderr_lines)` observed before the failure.
    pub fn line_counts(&self) -> Option<(usize, usize)> {
        match self {
            RunnerError::NonZeroExit {
                stdout_lines,
                stderr_lines,
                ..
            } => Some((*stdout_lines, *stderr_lines)),
            RunnerError::Streaming { captured, .. } | RunnerError::Cancelled { captured } => {
                Some((captured.stdout_lines, captured.stderr_lines))
            }
            _ => None,
        }
    }

    pub fn captured(&self) -> Option<&CapturedOutput> {
        match self {
            RunnerError::Streaming { captured, .. } | RunnerError::Cancelled { captured } => {
                Some(captured)
            }
            _ => None,
        }
    }
}

impl From<StorageError> for RunnerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidHandle(_) | StorageError::InvalidName(_) => {
                RunnerError::Validation {
                    message: err.to_string(),
                }
            }
            other => RunnerError::Storage {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_exposes_exit_code_and_counts() {
        let captured = CapturedOutput {
            stdout_lines: 3,
            stderr_lines: 1,
            ..Default::default()
        };
        let err = RunnerError::non_zero_exit(66, &captured);

        assert_eq!(err.code(), "SCRIPT_RUNNER_NON_ZERO_EXIT");
        assert_eq!(err.exit_code(), Some(66));
        assert_eq!(err.line_counts(), Some((3, 1)));
        assert!(err.captured().is_none());
    }

    #[test]
    fn cancelled_keeps_captured_output() {
        let mut captured = CapturedOutput {
            stdout_lines: 2,
            ..Default::default()
        };
        captured
            .outputs
            .insert("partial".to_string(), serde_json::json!(true));
        let err = RunnerError::Cancelled { captured };

        assert_eq!(err.exit_code(), None);
        assert_eq!(err.line_counts(), Some((2, 0)));
        assert!(err.captured().unwrap().outputs.contains_key("partial"));
    }

    #[test]
    fn storage_handle_errors_are_validation_failures() {
        let err: RunnerError = StorageError::InvalidHandle("s3://x".into()).into();
        assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST");

        let err: RunnerError = StorageError::NotFound("storage:///x".into()).into();
        assert_eq!(err.code(), "SCRIPT_RUNNER_STORAGE");
    }
}
