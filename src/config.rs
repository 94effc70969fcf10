//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_STORAGE_AUDIO_DIR, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// Server bind settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: localhost only (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Segment storage and flush behavior.
///
/// ## Fields:
/// - `audio_dir`: directory holding persisted `.webm` segments
/// - `flush_interval_secs`: how long a session lane accumulates bytes
///   before traffic triggers a segment write (the soft 10-second window)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub audio_dir: String,
    pub flush_interval_secs: u64,
}

/// Capacity limits.
///
/// ## Fields:
/// - `max_waiting_peers`: per-role waiting queue bound; connections past it
///   are refused rather than queued without bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_waiting_peers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                audio_dir: "audio_sessions".to_string(),
                flush_interval_secs: 10,
            },
            performance: PerformanceConfig {
                max_waiting_peers: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, then config.toml (if present),
    /// then `APP_*` environment variables, with `HOST`/`PORT` handled as
    /// deployment-platform special cases.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.storage.audio_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("Audio storage directory cannot be empty"));
        }

        if self.storage.flush_interval_secs == 0 {
            return Err(anyhow::anyhow!("Flush interval must be greater than 0"));
        }

        if self.performance.max_waiting_peers == 0 {
            return Err(anyhow::anyhow!("Max waiting peers must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document (runtime config endpoint).
    ///
    /// Only the fields present in the JSON are touched; the result is
    /// validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(storage) = partial_config.get("storage") {
            if let Some(dir) = storage.get("audio_dir").and_then(|v| v.as_str()) {
                self.storage.audio_dir = dir.to_string();
            }
            if let Some(interval) = storage.get("flush_interval_secs").and_then(|v| v.as_u64()) {
                self.storage.flush_interval_secs = interval;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(peers) = performance.get("max_waiting_peers").and_then(|v| v.as_u64()) {
                self.performance.max_waiting_peers = peers as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.flush_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.flush_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_waiting_peers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"storage": {"flush_interval_secs": 30}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.storage.flush_interval_secs, 30);
        // Untouched fields keep their values.
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"storage": {"flush_interval_secs": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
