use crate::error::RunnerError;
use crate::protocol::{MetricEvent, MetricKind};
use metrics::{counter, histogram};
use std::time::Duration;

/// Runner metrics recorder for Prometheus/monitoring
pub struct RunnerMetrics;

impl RunnerMetrics {
    /// Count a finished execution and record how long it took.
    pub fn record_execution(runner: &str, outcome: &Result<i64, RunnerError>, elapsed: Duration) {
        let result = match outcome {
            Ok(_) => "success",
            Err(err) => Self::result_label(err),
        };
        counter!("script_runner_executions_total", 1,
            "runner" => runner.to_string(),
            "result" => result.to_string()
        );
        histogram!(
            "script_runner_execution_duration_ms",
            elapsed.as_millis() as f64,
            "runner" => runner.to_string()
        );
    }

    /// `result` is one of `success`, `retry`, `failure`.
    pub fn record_image_pull(result: &str) {
        counter!("script_runner_image_pulls_total", 1, "result" => result.to_string());
    }

    /// Forward metrics a script published through protocol frames.
    pub fn record_script_metrics(metrics: &[MetricEvent]) {
        for metric in metrics {
            let mut labels: Vec<(String, String)> = metric
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            labels.push(("name".to_string(), metric.name.clone()));

            match metric.kind {
                MetricKind::Counter => {
                    if metric.value.is_finite() && metric.value >= 0.0 {
                        counter!(
                            "script_runner_script_counter",
                            metric.value.round() as u64,
                            &labels
                        );
                    }
                }
                MetricKind::Timer => {
                    histogram!("script_runner_script_timer_seconds", metric.value, &labels);
                }
            }
        }
    }

    fn result_label(err: &RunnerError) -> &'static str {
        match err {
            RunnerError::NonZeroExit { .. } => "non_zero_exit",
            RunnerError::Cancelled { .. } => "cancelled",
            RunnerError::Validation { .. } => "invalid",
            _ => "error",
        }
    }
}
