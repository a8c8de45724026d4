//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_MODEL_DEFAULT_MODEL, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Model lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model used when no preference has ever been persisted
    pub default_model: String,

    /// Device preference: "auto", "cpu", "cuda", "metal"
    pub device: String,

    /// Compute type preference: "auto", "int8", "float16", "float32"
    pub compute_type: String,

    /// Seconds of idleness before the resident model is evicted
    pub unload_delay_secs: u64,

    /// Path of the JSON file recording the last successfully loaded model
    pub settings_file: String,
}

/// Request size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accepted audio upload size in megabytes
    pub max_upload_mb: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            model: ModelConfig {
                default_model: "base".to_string(),
                device: "auto".to_string(),
                compute_type: "auto".to_string(),
                unload_delay_secs: 3600,
                settings_file: "whisper_settings.json".to_string(),
            },
            limits: LimitsConfig { max_upload_mb: 50 },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment.
    ///
    /// `HOST` and `PORT` are honored without the `APP_` prefix because
    /// deployment platforms commonly inject them that way.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.model.default_model.trim().is_empty() {
            return Err(anyhow::anyhow!("Default model cannot be empty"));
        }

        if self.model.unload_delay_secs == 0 {
            return Err(anyhow::anyhow!("Unload delay must be greater than 0"));
        }

        if self.limits.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        Ok(())
    }

    /// Maximum upload size in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.limits.max_upload_mb * 1024 * 1024
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
        assert_eq!(config.model.default_model, "base");
        assert_eq!(config.model.unload_delay_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.unload_delay_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.default_model = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_limit_bytes() {
        let config = AppConfig::default();
        assert_eq!(config.max_upload_bytes(), 50 * 1024 * 1024);
    }
}
