use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::account::ConnectedAccount;
use crate::error::{Result, WaypointError};

/// Top-level Waypoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
}

/// Model settings handed to the provider with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// What to do when a node writes an output key it did not declare.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputPolicy {
    /// Reject the write and report it to the model as a tool error.
    #[default]
    Strict,
    /// Accept the write and log a warning.
    Warn,
}

/// Execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Seconds to wait for the next stream event before treating the call
    /// as a transient failure.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default)]
    pub output_policy: OutputPolicy,
    /// Drop all parts before each transition marker.
    #[serde(default)]
    pub prune_on_transition: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            output_policy: OutputPolicy::default(),
            prune_on_transition: false,
        }
    }
}

fn default_stream_idle_timeout() -> u64 { 120 }

/// Retry configuration for provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

fn default_max_retries() -> u32 { 5 }
fn default_base_delay() -> f64 { 2.0 }
fn default_max_delay() -> f64 { 120.0 }

/// Conversation store backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One JSON file per part.
    #[default]
    File,
    /// One SQLite database per session.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    #[serde(default)]
    pub backend: StorageBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            backend: StorageBackend::default(),
        }
    }
}

fn default_sessions_dir() -> String { "~/.waypoint/sessions".to_string() }

/// Connected accounts advertised to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountsConfig {
    #[serde(default)]
    pub connected: Vec<ConnectedAccount>,
    /// Tool name -> provider name. When set, the accounts block is grouped
    /// by provider and filtered to the current node's tools.
    #[serde(default)]
    pub tool_providers: Option<HashMap<String, String>>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))
    }

    /// Load the config if the file exists, else fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the sessions directory (expand ~).
    pub fn sessions_dir(&self) -> PathBuf {
        expand_home(&self.storage.sessions_dir)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference if the variable is not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WAYPOINT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WAYPOINT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WAYPOINT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WAYPOINT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WAYPOINT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.model.provider, "anthropic");
        assert_eq!(config.engine.retry.max_retries, 5);
        assert_eq!(config.engine.retry.base_delay_secs, 2.0);
        assert_eq!(config.engine.retry.max_delay_secs, 120.0);
        assert_eq!(config.engine.output_policy, OutputPolicy::Strict);
        assert!(!config.engine.prune_on_transition);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert!(config.accounts.connected.is_empty());
        assert!(config.accounts.tool_providers.is_none());
    }

    #[test]
    fn test_storage_and_policy_overrides() {
        let toml_str = r#"
[engine]
output_policy = "warn"
prune_on_transition = true

[engine.retry]
max_retries = 2

[storage]
sessions_dir = "/var/lib/waypoint"
backend = "sqlite"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.output_policy, OutputPolicy::Warn);
        assert!(config.engine.prune_on_transition);
        assert_eq!(config.engine.retry.max_retries, 2);
        assert_eq!(config.engine.retry.max_delay_secs, 120.0);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.sessions_dir(), PathBuf::from("/var/lib/waypoint"));
    }

    #[test]
    fn test_expand_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                expand_home("~/.waypoint/sessions"),
                PathBuf::from(home).join(".waypoint/sessions")
            );
        }
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
}
