use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CasebookError, Result};

/// Top-level Casebook configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Callback credentials handed to every script as secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default)]
    pub key: String,
}

fn default_api_url() -> String { "http://localhost:8000/api".to_string() }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Working directory inside the script container.
    #[serde(default = "default_sandbox_workdir")]
    pub workdir: String,
    #[serde(default = "default_sandbox_memory")]
    pub memory_mb: u64,
    /// Upper bound on a single script run.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    /// Docker network to attach script containers to (runtime default if unset).
    #[serde(default)]
    pub network: Option<String>,
    /// How long to let the log reader drain after the container exits.
    #[serde(default = "default_log_grace_ms")]
    pub log_grace_ms: u64,
}

fn default_sandbox_workdir() -> String { "/home".to_string() }
fn default_sandbox_memory() -> u64 { 512 }
fn default_sandbox_timeout() -> u64 { 600 }
fn default_log_grace_ms() -> u64 { 500 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workdir: default_sandbox_workdir(),
            memory_mb: default_sandbox_memory(),
            timeout_secs: default_sandbox_timeout(),
            network: None,
            log_grace_ms: default_log_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-topic broadcast buffer.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize { 256 }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String { "~/.casebook/casebook.db".to_string() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CasebookError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| CasebookError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        let path = &self.database.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference when unset
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
    fn test_defaults_from_empty_document() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.sandbox.workdir, "/home");
        assert_eq!(config.sandbox.timeout_secs, 600);
        assert_eq!(config.bus.capacity, 256);
        assert!(config.sandbox.network.is_none());
    }

    #[test]
    fn test_expand_keeps_unknown_vars() {
        let out = expand_env_vars("key = \"${CASEBOOK_SURELY_UNSET_VAR}\"");
        assert_eq!(out, "key = \"${CASEBOOK_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_database_path_plain() {
        let mut config = AppConfig::default();
        config.database.path = "/var/lib/casebook.db".into();
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/casebook.db"));
    }
}
