//! Translation of human resource limits into engine integers.

use super::options::ContainerOptions;
use crate::error::RunnerError;
use tracing::warn;

/// Engine-ready resource limits. `None` leaves the engine default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub nano_cpus: Option<i64>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub memory_swappiness: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub kernel_memory: Option<i64>,
    pub oom_kill_disable: Option<bool>,
    pub shm_size: Option<i64>,
}

impl ResourceLimits {
    pub fn from_options(options: &ContainerOptions) -> Result<Self, RunnerError> {
        let limits = Self {
            nano_cpus: options.cpus.map(nano_cpus).transpose()?,
            memory: parse_opt("memory", options.memory.as_deref())?,
            memory_swap: parse_opt("memorySwap", options.memory_swap.as_deref())?,
            memory_swappiness: options
                .memory_swappiness
                .map(|value| {
                    if (0..=100).contains(&value) {
                        Ok(value)
                    } else {
                        Err(RunnerError::validation(format!(
                            "memorySwappiness must be between 0 and 100, got {}",
                            value
                        )))
                    }
                })
                .transpose()?,
            memory_reservation: parse_opt(
                "memoryReservation",
                options.memory_reservation.as_deref(),
            )?,
            kernel_memory: parse_opt("kernelMemory", options.kernel_memory.as_deref())?,
            oom_kill_disable: options.oom_kill_disable,
            shm_size: parse_opt("shmSize", options.shm_size.as_deref())?,
        };

        if limits.kernel_memory.is_some() {
            warn!("kernelMemory is no longer supported by the container engine and is ignored");
        }
        Ok(limits)
    }
}

fn parse_opt(field: &str, value: Option<&str>) -> Result<Option<i64>, RunnerError> {
    value
        .map(|raw| {
            parse_size(raw).ok_or_else(|| {
                RunnerError::validation(format!("Invalid size '{}' for {}", raw, field))
            })
        })
        .transpose()
}

/// Parse `512Mi`, `1g`, `256m`, `10KB` or plain bytes. Unit letters are binary
/// multiples regardless of an `i` suffix. `-1` (unlimited) is passed through.
pub fn parse_size(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if value == "-1" {
        return Some(-1);
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    if number.is_empty() {
        return None;
    }
    let number: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" | "ki" | "kib" => 1024.0,
        "m" | "mb" | "mi" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" | "ti" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let bytes = (number * multiplier).round();
    if !bytes.is_finite() || bytes > i64::MAX as f64 {
        return None;
    }
    Some(bytes as i64)
}

fn nano_cpus(cpus: f64) -> Result<i64, RunnerError> {
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(RunnerError::validation(format!(
            "cpus must be a positive number, got {}",
            cpus
        )));
    }
    Ok((cpus * 1_000_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_sizes() {
        assert_eq!(parse_size("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("256m"), Some(256 * 1024 * 1024));
        assert_eq!(parse_size("10KB"), Some(10 * 1024));
        assert_eq!(parse_size("1.5Gi"), Some(1_610_612_736));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size(" 2 g "), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("-1"), Some(-1));
    }

    #[test]
    fn rejects_unparsable_sizes() {
        for raw in ["", "lots", "12x", "Mi", "1..2g", "-5m"] {
            assert_eq!(parse_size(raw), None, "{}", raw);
        }
    }

    #[test]
    fn invalid_size_is_a_validation_error() {
        let options = ContainerOptions {
            memory: Some("a lot".into()),
            ..Default::default()
        };
        let err = ResourceLimits::from_options(&options).unwrap_err();
        assert_eq!(err.code(), "SCRIPT_RUNNER_INVALID_REQUEST");
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn translates_cpus_and_swappiness() {
        let options = ContainerOptions {
            cpus: Some(1.5),
            memory_swappiness: Some(60),
            shm_size: Some("64m".into()),
            oom_kill_disable: Some(true),
            ..Default::default()
        };
        let limits = ResourceLimits::from_options(&options).unwrap();
        assert_eq!(limits.nano_cpus, Some(1_500_000_000));
        assert_eq!(limits.memory_swappiness, Some(60));
        assert_eq!(limits.shm_size, Some(64 * 1024 * 1024));
        assert_eq!(limits.oom_kill_disable, Some(true));

        let bad = ContainerOptions {
            memory_swappiness: Some(101),
            ..Default::default()
        };
        assert!(ResourceLimits::from_options(&bad).is_err());

        let zero = ContainerOptions {
            cpus: Some(0.0),
            ..Default::default()
        };
        assert!(ResourceLimits::from_options(&zero).is_err());
    }
}
