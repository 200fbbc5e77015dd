//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every section is `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub backend: BackendSettings,
    pub engine: EngineSettings,
    pub sessions: SessionSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would make the gateway unusable.
    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("backend.baseUrl is empty".into()));
        }
        if self.engine.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("engine.baseUrl is empty".into()));
        }
        if self.sessions.root.as_os_str().is_empty() {
            return Err(SettingsError::InvalidValue("sessions.root is empty".into()));
        }
        Ok(())
    }
}

/// Control API listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Backend control plane receiving callbacks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Callback endpoints are resolved relative to this URL.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/sorin/api".into(),
            timeout_secs: 30,
        }
    }
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Messaging engine sidecar.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".into(),
            timeout_secs: 60,
        }
    }
}

impl EngineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-user session directories and their cleanup policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Directory holding one `user-<id>` directory per user.
    pub root: PathBuf,
    /// Retries after the first failed delete attempt.
    pub cleanup_max_retries: u32,
    /// Fixed delay between delete attempts.
    pub cleanup_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sessions"),
            cleanup_max_retries: 5,
            cleanup_delay_ms: 2000,
        }
    }
}

impl SessionSettings {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// One of trace, debug, info, warn, error.
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            log_to_sqlite: false,
            db_path: PathBuf::from("logs/relay-logs.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let s = RelaySettings::default();
        assert_eq!(s.server.port, 3000);
        assert_eq!(s.backend.base_url, "http://localhost/sorin/api");
        assert_eq!(s.sessions.root, PathBuf::from("sessions"));
        assert_eq!(s.sessions.cleanup_max_retries, 5);
        assert_eq!(s.sessions.cleanup_delay(), Duration::from_secs(2));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"server":{"port":8080},"sessions":{"cleanupDelayMs":10}}"#).unwrap();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.sessions.cleanup_delay_ms, 10);
        assert_eq!(s.sessions.cleanup_max_retries, 5);
    }

    #[test]
    fn validate_rejects_empty_backend() {
        let mut s = RelaySettings::default();
        s.backend.base_url = "  ".into();
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["backend"].get("baseUrl").is_some());
        assert!(json["sessions"].get("cleanupMaxRetries").is_some());
    }
}
