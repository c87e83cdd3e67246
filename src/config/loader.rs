//! Configuration Loader
//!
//! Environment-aware layered loading:
//!
//! 1. built-in defaults
//! 2. `config/pg-listener.yaml` (or an explicit `--config` file)
//! 3. `config/pg-listener.<environment>.yaml` next to it
//! 4. `PG_LISTENER__<SECTION>__<KEY>` environment variables

use config::{Config, Environment, File};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{detect_environment, AppConfig};
use crate::error::Result;

#[cfg(test)]
use crate::error::ListenerError;

pub const DEFAULT_CONFIG_DIR: &str = "config";
pub const CONFIG_FILE_STEM: &str = "pg-listener";
pub const ENV_PREFIX: &str = "PG_LISTENER";

const SENSITIVE_PATTERNS: [&str; 5] = ["password", "passwd", "secret", "token", "credential"];

/// Builds an [`AppConfig`] from files and environment variables
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    environment: String,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader for the auto-detected environment and default file location
    pub fn new() -> Self {
        Self {
            config_file: None,
            environment: detect_environment(),
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Read the base configuration from `path`; the file must exist
    pub fn with_config_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_environment<S: Into<String>>(mut self, environment: S) -> Self {
        self.environment = environment.into().to_lowercase();
        self
    }

    /// Prefix for environment variable overrides
    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn base_file(&self) -> PathBuf {
        self.config_file.clone().unwrap_or_else(|| {
            Path::new(DEFAULT_CONFIG_DIR).join(format!("{CONFIG_FILE_STEM}.yaml"))
        })
    }

    fn environment_file(&self) -> PathBuf {
        let base = self.base_file();
        let directory = base.parent().unwrap_or_else(|| Path::new("."));
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(CONFIG_FILE_STEM);
        let extension = base.extension().and_then(|e| e.to_str()).unwrap_or("yaml");
        directory.join(format!("{stem}.{}.{extension}", self.environment))
    }

    /// Load, merge and validate the configuration
    pub fn load(&self) -> Result<AppConfig> {
        let config = self.load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and merge without validating.
    ///
    /// For callers that still apply overrides (such as `--channel`) and then
    /// call [`AppConfig::validate`] themselves.
    pub fn load_unvalidated(&self) -> Result<AppConfig> {
        let base_file = self.base_file();
        let environment_file = self.environment_file();

        debug!(
            environment = %self.environment,
            base_file = %base_file.display(),
            environment_file = %environment_file.display(),
            "Loading configuration"
        );

        let config: AppConfig = Config::builder()
            .add_source(File::from(base_file.clone()).required(self.config_file.is_some()))
            .add_source(File::from(environment_file).required(false))
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string_pretty(&sanitize_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %self.environment,
            database_host = %config.database.host,
            channel = %config.database.channel,
            bus_url = %config.bus.service_url,
            subject = %config.bus.subject(),
            "Configuration loaded"
        );

        Ok(config)
    }
}

/// JSON view of `config` with credentials masked
pub fn sanitize_for_logging(config: &AppConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    sanitize_json_recursive(&mut value);
    value
}

fn sanitize_json_recursive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_sensitive = SENSITIVE_PATTERNS
                    .iter()
                    .any(|pattern| key_lower.contains(pattern));

                if !is_sensitive {
                    sanitize_json_recursive(val);
                    continue;
                }

                let masked = match &*val {
                    Value::Null => Value::Null,
                    Value::String(s) if s.is_empty() => Value::String("[EMPTY]".to_string()),
                    Value::String(s) if s.chars().count() > 4 => {
                        let chars: Vec<char> = s.chars().collect();
                        let head: String = chars[..2].iter().collect();
                        let tail: String = chars[chars.len() - 2..].iter().collect();
                        Value::String(format!("[MASKED: {head}***{tail}]"))
                    }
                    _ => Value::String("[MASKED]".to_string()),
                };
                *val = masked;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_json_recursive),
        _ => {}
    }
}
