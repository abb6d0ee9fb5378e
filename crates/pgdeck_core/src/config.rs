//! Console configuration.
//!
//! Values come from built-in defaults, then an optional JSON file, then `PGDECK_*`
//! environment variables.

use crate::error::{PgDeckError, PgDeckResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Site-wide settings for the console core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Whether encrypted passwords may be kept in session snapshots.
    pub store_secrets_in_session: bool,
    /// Whether SSH tunnels are honoured at all.
    pub support_ssh_tunnel: bool,
    /// `application_name` reported to the server.
    pub application_name: String,
    /// Connect timeout used when a server does not set one (0 = none).
    pub default_connect_timeout_secs: u32,
    /// Application data directory.
    pub data_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Root directory for background job output.
    pub jobs_dir: PathBuf,
    /// Path of the `pgdeck-executor` binary.
    pub executor_path: PathBuf,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            store_secrets_in_session: true,
            support_ssh_tunnel: true,
            application_name: "pgdeck".to_string(),
            default_connect_timeout_secs: 10,
            log_dir: data_dir.join("logs"),
            jobs_dir: data_dir.join("jobs"),
            executor_path: default_executor_path(),
            data_dir,
        }
    }
}

impl ConsoleConfig {
    /// Load defaults, the optional file and environment overrides.
    pub fn load(path: Option<&Path>) -> PgDeckResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        tracing::debug!(data_dir = %config.data_dir.display(), "Console configuration loaded");
        Ok(config)
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> PgDeckResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PgDeckError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| PgDeckError::config(format!("Invalid config {}: {e}", path.display())))
    }

    /// Apply `PGDECK_*` overrides from a variable lookup.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> PgDeckResult<()> {
        if let Some(v) = var("PGDECK_STORE_SECRETS_IN_SESSION") {
            self.store_secrets_in_session = parse_bool("PGDECK_STORE_SECRETS_IN_SESSION", &v)?;
        }
        if let Some(v) = var("PGDECK_SUPPORT_SSH_TUNNEL") {
            self.support_ssh_tunnel = parse_bool("PGDECK_SUPPORT_SSH_TUNNEL", &v)?;
        }
        if let Some(v) = var("PGDECK_APPLICATION_NAME") {
            self.application_name = v;
        }
        if let Some(v) = var("PGDECK_CONNECT_TIMEOUT") {
            self.default_connect_timeout_secs = v.trim().parse().map_err(|_| {
                PgDeckError::config(format!("PGDECK_CONNECT_TIMEOUT must be a number, got {v:?}"))
            })?;
        }
        if let Some(v) = var("PGDECK_DATA_DIR") {
            // Derived directories follow the data dir unless set explicitly.
            let data_dir = PathBuf::from(v);
            if self.log_dir == self.data_dir.join("logs") {
                self.log_dir = data_dir.join("logs");
            }
            if self.jobs_dir == self.data_dir.join("jobs") {
                self.jobs_dir = data_dir.join("jobs");
            }
            self.data_dir = data_dir;
        }
        if let Some(v) = var("PGDECK_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PGDECK_JOBS_DIR") {
            self.jobs_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PGDECK_EXECUTOR") {
            self.executor_path = PathBuf::from(v);
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> PgDeckResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PgDeckError::config(format!("{name} must be a boolean, got {value:?}"))),
    }
}

/// Default application data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("pgdeck")
}

/// The executor binary next to the current executable.
fn default_executor_path() -> PathBuf {
    let name = if cfg!(windows) { "pgdeck-executor.exe" } else { "pgdeck-executor" };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PGDECK_STORE_SECRETS_IN_SESSION", "no"),
            ("PGDECK_DATA_DIR", "/srv/pgdeck"),
            ("PGDECK_CONNECT_TIMEOUT", "3"),
        ]
        .into_iter()
        .collect();

        let mut config = ConsoleConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert!(!config.store_secrets_in_session);
        assert!(config.support_ssh_tunnel);
        assert_eq!(config.default_connect_timeout_secs, 3);
        assert_eq!(config.jobs_dir, PathBuf::from("/srv/pgdeck/jobs"));
        assert_eq!(config.log_dir, PathBuf::from("/srv/pgdeck/logs"));
    }

    #[test]
    fn test_bad_env_value_is_a_config_error() {
        let mut config = ConsoleConfig::default();
        let err = config
            .apply_env(|k| (k == "PGDECK_SUPPORT_SSH_TUNNEL").then(|| "maybe".to_string()))
            .unwrap_err();
        assert_eq!(err.category(), "Config");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgdeck.json");
        std::fs::write(&path, r#"{ "support_ssh_tunnel": false }"#).unwrap();

        let config = ConsoleConfig::from_file(&path).unwrap();
        assert!(!config.support_ssh_tunnel);
        assert_eq!(config.application_name, "pgdeck");
    }
}
