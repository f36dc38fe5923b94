use super::engine::{ContainerEngine, EngineError};
use super::options::{PullPolicy, RegistryCredentials};
use crate::error::RunnerError;
use crate::telemetry::RunnerMetrics;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Exponential backoff for image pulls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Add `:latest` when the reference names neither a tag nor a digest.
pub fn normalize_image(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Make sure `image` is available to the engine according to `policy`.
#[instrument(level = "info", skip(engine, retry, credentials))]
pub async fn ensure_image(
    engine: &dyn ContainerEngine,
    image: &str,
    policy: PullPolicy,
    retry: &RetryPolicy,
    credentials: Option<&RegistryCredentials>,
) -> Result<(), RunnerError> {
    let image = normalize_image(image);
    match policy {
        PullPolicy::Never => {
            debug!("Pull policy NEVER; using local image as is");
            Ok(())
        }
        PullPolicy::IfNotPresent => match engine.image_exists(&image).await {
            Ok(true) => {
                debug!("Image present locally; skipping pull");
                Ok(())
            }
            Ok(false) => pull_with_retry(engine, &image, retry, credentials).await,
            Err(err) => {
                warn!(error = %err, "Image inspect failed; pulling");
                pull_with_retry(engine, &image, retry, credentials).await
            }
        },
        PullPolicy::Always => pull_with_retry(engine, &image, retry, credentials).await,
    }
}

async fn pull_with_retry(
    engine: &dyn ContainerEngine,
    image: &str,
    retry: &RetryPolicy,
    credentials: Option<&RegistryCredentials>,
) -> Result<(), RunnerError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure: EngineError = match engine.pull_image(image, credentials).await {
            Ok(()) => {
                info!(attempt, "Pulled image");
                RunnerMetrics::record_image_pull("success");
                return Ok(());
            }
            Err(err) => err,
        };

        if !failure.is_transient() || attempt >= max_attempts {
            RunnerMetrics::record_image_pull("failure");
            return Err(RunnerError::ImagePull {
                image: image.to_string(),
                attempts: attempt,
                message: failure.to_string(),
            });
        }

        let delay = retry.delay_after(attempt);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Transient image pull failure; retrying"
        );
        RunnerMetrics::record_image_pull("retry");
        tokio::time::sleep(delay).await;
    }
}
