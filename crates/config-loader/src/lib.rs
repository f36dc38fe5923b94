//! Schema-validated JSON configuration.
//!
//! A configuration named `<name>` lives at `<config_dir>/<name>.json` and is
//! validated against `<contracts_dir>/config/<name>-config.v1.json`. Top-level
//! properties missing from the file (or the whole file, when absent) are taken
//! from the schema's `default` values.

use jsonschema::{Draft, JSONSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub const DEFAULT_CONFIG_DIR: &str = ".script-runner/config";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Schema not found for config: {name}")]
    SchemaNotFound { name: String },

    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed: {}", summarize(.errors))]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.json_pointer.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.json_pointer, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct ConfigManager {
    contracts_dir: PathBuf,
    config_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        let contracts_dir =
            Self::find_contracts_dir().unwrap_or_else(|| PathBuf::from("contracts"));
        let config_dir = Self::find_config_dir();

        Self {
            contracts_dir,
            config_dir,
        }
    }

    pub fn with_dirs(contracts_dir: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            contracts_dir,
            config_dir,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn contracts_dir(&self) -> &Path {
        &self.contracts_dir
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.json", name))
    }

    fn schema_path(&self, name: &str) -> PathBuf {
        self.contracts_dir
            .join("config")
            .join(format!("{}-config.v1.json", name))
    }

    fn find_contracts_dir() -> Option<PathBuf> {
        if let Ok(contracts_dir) = std::env::var("CONTRACTS_DIR") {
            let path = PathBuf::from(contracts_dir);
            if path.is_dir() {
                return Some(path);
            }
        }

        // Walk up from the current directory
        let mut current = std::env::current_dir().ok()?;
        loop {
            let contracts_path = current.join("contracts");
            if contracts_path.is_dir() {
                return Some(contracts_path);
            }
            if !current.pop() {
                break;
            }
        }
        None
    }

    fn find_config_dir() -> PathBuf {
        match std::env::var("CONFIG_DIR") {
            Ok(config_dir) => PathBuf::from(config_dir),
            Err(_) => PathBuf::from(DEFAULT_CONFIG_DIR),
        }
    }

    /// Load, complete with schema defaults, validate and deserialize.
    #[instrument(skip(self))]
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConfigError> {
        let value = self.load_value(name)?;
        serde_json::from_value(value).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })
    }

    /// The effective configuration as JSON, after defaults and validation.
    #[instrument(skip(self))]
    pub fn load_value(&self, name: &str) -> Result<Value, ConfigError> {
        let schema = self.read_schema(name)?;
        let mut config = self.load_config_file(name)?;
        apply_schema_defaults(&mut config, &schema);
        self.validate_against(&schema, &config)?;
        debug!(config = %config, "Loaded config");
        Ok(config)
    }

    /// Validate an explicit file. A missing file is an error here.
    #[instrument(skip(self))]
    pub fn validate_config_file(&self, name: &str, config_path: &Path) -> Result<(), ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: config_path.to_string_lossy().to_string(),
            });
        }
        let config = read_json(config_path, "config")?;
        self.validate_config_value(name, &config)
    }

    #[instrument(skip(self, config))]
    pub fn validate_config_value(&self, name: &str, config: &Value) -> Result<(), ConfigError> {
        let schema = self.read_schema(name)?;
        self.validate_against(&schema, config)
    }

    fn load_config_file(&self, name: &str) -> Result<Value, ConfigError> {
        let config_path = self.config_path(name);
        debug!("Loading config from: {:?}", config_path);

        if !config_path.exists() {
            debug!("Config file not found, using schema defaults");
            return Ok(Value::Object(Map::new()));
        }
        read_json(&config_path, "config")
    }

    fn read_schema(&self, name: &str) -> Result<Value, ConfigError> {
        let schema_path = self.schema_path(name);
        if !schema_path.exists() {
            return Err(ConfigError::SchemaNotFound {
                name: name.to_string(),
            });
        }
        read_json(&schema_path, "schema")
    }

    fn validate_against(&self, schema: &Value, config: &Value) -> Result<(), ConfigError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| ConfigError::SchemaCompilationFailed {
                message: e.to_string(),
            })?;

        if let Err(errors) = compiled.validate(config) {
            let errors: Vec<ValidationError> = errors
                .map(|error| ValidationError {
                    json_pointer: error.instance_path.to_string(),
                    message: error.to_string(),
                    schema_path: error.schema_path.to_string(),
                })
                .collect();
            return Err(ConfigError::ValidationFailed { errors });
        }

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill top-level properties absent from `config` with the schema defaults.
/// Non-object configs are left alone for validation to reject.
pub fn apply_schema_defaults(config: &mut Value, schema: &Value) {
    let (Some(config), Some(properties)) = (
        config.as_object_mut(),
        schema.get("properties").and_then(Value::as_object),
    ) else {
        return;
    };

    for (key, property) in properties {
        if let Some(default_value) = property.get("default") {
            config
                .entry(key.clone())
                .or_insert_with(|| default_value.clone());
        }
    }
}

fn read_json(path: &Path, what: &str) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read {} file {}: {}", what, path.display(), e),
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
        message: format!("{}: {}", path.display(), e),
    })
}
