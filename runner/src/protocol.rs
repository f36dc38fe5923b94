//! Structured output protocol.
//!
//! A script publishes values by printing a line that is exactly `::` + a JSON
//! object + `::`, for example
//! `::{"outputs":{"key":"value"},"metrics":[{"name":"count","type":"counter","value":1}]}::`.
//! Anything else is ordinary output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

static FRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^::(\{.*\})::$").expect("protocol frame pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    /// Duration in seconds.
    Timer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub value: f64,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub tags: BTreeMap<String, String>,
}

/// Outputs and metrics carried by one line. Empty for ordinary lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolFrame {
    pub outputs: BTreeMap<String, Value>,
    pub metrics: Vec<MetricEvent>,
}

impl ProtocolFrame {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.metrics.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    outputs: Option<Map<String, Value>>,
    #[serde(default)]
    metrics: Vec<Value>,
}

/// Parse a single complete line. Never fails: malformed frames are logged and
/// yield an empty frame.
pub fn parse_line(line: &str) -> ProtocolFrame {
    let Some(captures) = FRAME.captures(line) else {
        return ProtocolFrame::default();
    };
    let body = &captures[1];

    let raw: RawFrame = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "Ignoring malformed protocol frame");
            return ProtocolFrame::default();
        }
    };

    let outputs = raw
        .outputs
        .map(|map| map.into_iter().collect())
        .unwrap_or_default();

    let metrics = raw
        .metrics
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<MetricEvent>(entry) {
            Ok(metric) => Some(metric),
            Err(err) => {
                warn!(error = %err, "Skipping malformed metric in protocol frame");
                None
            }
        })
        .collect();

    ProtocolFrame { outputs, metrics }
}

fn lenient_tags<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<Map<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}
