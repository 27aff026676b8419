use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config as ConfigLoader, Environment, File};
use secgate_api::observability::LogFormat;
use serde::Deserialize;

/// Startup settings. Layered from `config/default`, `config/local` and
/// `SECGATE_*` environment variables, later sources winning.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Preset or environment name, e.g. `production` or `dev`.
    pub preset: String,
    /// JSON policy document imported on top of the preset.
    pub policy_file: Option<PathBuf>,
    pub rate_limit_cleanup_secs: u64,
    pub token_cleanup_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let defaults = Settings::default();
        let config = ConfigLoader::builder()
            .set_default("port", i64::from(defaults.port))?
            .set_default("log_level", defaults.log_level)?
            .set_default("log_format", "json")?
            .set_default("preset", defaults.preset)?
            .set_default("rate_limit_cleanup_secs", defaults.rate_limit_cleanup_secs as i64)?
            .set_default("token_cleanup_secs", defaults.token_cleanup_secs as i64)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("SECGATE"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn rate_limit_cleanup(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cleanup_secs.max(1))
    }

    pub fn token_cleanup(&self) -> Duration {
        Duration::from_secs(self.token_cleanup_secs.max(1))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            preset: "production".to_string(),
            policy_file: None,
            rate_limit_cleanup_secs: 300,
            token_cleanup_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_sweep_intervals() {
        let settings = Settings::default();
        assert_eq!(settings.rate_limit_cleanup(), Duration::from_secs(300));
        assert_eq!(settings.token_cleanup(), Duration::from_secs(3600));
        assert!(settings.policy_file.is_none());
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let settings = Settings {
            token_cleanup_secs: 0,
            ..Settings::default()
        };
        assert_eq!(settings.token_cleanup(), Duration::from_secs(1));
    }
}
