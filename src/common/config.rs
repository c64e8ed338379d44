// Engine Configuration
//
// Engine-wide settings, their session-level overrides and the handling of
// settings that would change the compiled shape of an existing query.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SERVICE_ID_CONFIG: &str = "bayun.service.id";
pub const PERSISTENT_PREFIX_CONFIG: &str = "bayun.persistent.prefix";
pub const TRANSIENT_PREFIX_CONFIG: &str = "bayun.transient.prefix";
pub const MAX_PERSISTENT_QUERIES_CONFIG: &str = "bayun.query.persistent.active.limit";
pub const APPLICATION_SERVER_CONFIG: &str = "application.server";
pub const APPLICATION_ID_CONFIG: &str = "application.id";
/// Override property holding the statements of a legacy RUN SCRIPT command
pub const RUN_SCRIPT_STATEMENTS_CONTENT: &str = "bayun.run.script.statements";
/// Prefix of every internal topic and application id
pub const INTERNAL_TOPIC_PREFIX: &str = "_bayun-";

/// Settings whose value at the time a command was first written must be
/// used again when that command is replayed.
pub const COMPATIBILITY_BREAKING_CONFIGS: &[&str] = &[SERVICE_ID_CONFIG, PERSISTENT_PREFIX_CONFIG];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub service_id: String,
    pub persistent_query_name_prefix: String,
    pub transient_query_name_prefix: String,
    /// Maximum number of running persistent queries, unlimited when unset
    pub max_persistent_queries: Option<usize>,
    pub application_server: Option<String>,
    /// Properties handed through to the runtime untouched
    pub runtime_properties: BTreeMap<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            service_id: "default_".to_string(),
            persistent_query_name_prefix: "query_".to_string(),
            transient_query_name_prefix: "transient_".to_string(),
            max_persistent_queries: None,
            application_server: None,
            runtime_properties: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply session-level property overrides on top of this config.
    ///
    /// Known keys update the matching setting; anything else becomes a runtime property.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, Value>) -> Result<Self> {
        let mut config = self.clone();
        for (key, value) in overrides {
            config.set(key, value)?;
        }
        Ok(config)
    }

    /// Pin compatibility-breaking settings to the values recorded on a command
    pub fn override_breaking_configs_with_original_values(&self, original: &BTreeMap<String, String>) -> Self {
        let mut config = self.clone();
        for key in COMPATIBILITY_BREAKING_CONFIGS {
            if let Some(value) = original.get(*key) {
                // string-valued settings only, so this cannot fail
                let _ = config.set(key, &Value::String(value.clone()));
            }
        }
        config
    }

    /// Current values of the compatibility-breaking settings, as recorded on new commands
    pub fn original_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert(SERVICE_ID_CONFIG.to_string(), self.service_id.clone());
        props.insert(PERSISTENT_PREFIX_CONFIG.to_string(), self.persistent_query_name_prefix.clone());
        props
    }

    /// Properties passed to the runtime for every query
    pub fn stream_properties(&self) -> BTreeMap<String, Value> {
        let mut props = self.runtime_properties.clone();
        if let Some(server) = &self.application_server {
            props.insert(APPLICATION_SERVER_CONFIG.to_string(), Value::String(server.clone()));
        }
        props
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            SERVICE_ID_CONFIG => self.service_id = expect_string(key, value)?,
            PERSISTENT_PREFIX_CONFIG => self.persistent_query_name_prefix = expect_string(key, value)?,
            TRANSIENT_PREFIX_CONFIG => self.transient_query_name_prefix = expect_string(key, value)?,
            APPLICATION_SERVER_CONFIG => self.application_server = Some(expect_string(key, value)?),
            MAX_PERSISTENT_QUERIES_CONFIG => {
                let limit = match value {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse::<u64>().ok(),
                    _ => None,
                };
                let limit = limit.ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("expected a non-negative integer, got {}", value),
                })?;
                self.max_persistent_queries = Some(limit as usize);
            }
            _ => {
                self.runtime_properties.insert(key.to_string(), value.clone());
            }
        }
        Ok(())
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a string, got {}", other),
        }),
    }
}
