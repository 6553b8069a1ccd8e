//! Application configuration

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use tracing::warn;

use crate::errors::ClientError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    pub decoder: DecoderConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cycles: CyclesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: default_version(),
            timezone: default_timezone(),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    pub executable: PathBuf,
    #[serde(default = "default_command_args")]
    pub command_args: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP connect timeout, also the per-attempt bound of the bringup probe.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_decoder_timeout")]
    pub timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub url: String,
    pub status_url: String,
    pub client_id: i64,
    pub secret_key: String,
    pub bearer_token: String,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_api_timeout")]
    pub timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_ping_interval")]
    pub ping_interval: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_file")]
    pub file: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file: default_database_file(),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct CyclesConfig {
    /// Pause between decoder read cycles.
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_parser_interval")]
    pub parser_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_analyser_interval")]
    pub analyser_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_sender_interval")]
    pub sender_interval: Duration,
    /// Upper bound on unbound packets loaded per correlation cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_ntp_sync_interval")]
    pub ntp_sync_interval: Duration,
}

impl Default for CyclesConfig {
    fn default() -> Self {
        Self {
            parser_interval: default_parser_interval(),
            analyser_interval: default_analyser_interval(),
            sender_interval: default_sender_interval(),
            batch_size: default_batch_size(),
            ntp_sync_interval: default_ntp_sync_interval(),
        }
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_command_args() -> String {
    "/tcp".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    31003
}

fn default_decoder_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_database_file() -> PathBuf {
    PathBuf::from("base.db")
}

fn default_parser_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_analyser_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_sender_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_batch_size() -> u32 {
    1000
}

fn default_ntp_sync_interval() -> Duration {
    Duration::from_secs(3600)
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("SKYBIND").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.api.secret_key.is_empty() {
            return Err(ClientError::ConfigurationError {
                message: "api.secret_key cannot be empty".to_string(),
            });
        }

        if self.api.bearer_token.is_empty() {
            return Err(ClientError::ConfigurationError {
                message: "api.bearer_token cannot be empty".to_string(),
            });
        }

        if self.api.url.is_empty() || self.api.status_url.is_empty() {
            return Err(ClientError::ConfigurationError {
                message: "api.url and api.status_url are required".to_string(),
            });
        }

        if self.cycles.batch_size == 0 {
            return Err(ClientError::ConfigurationError {
                message: "cycles.batch_size must be greater than zero".to_string(),
            });
        }

        if self.database.file.to_str().unwrap_or("").is_empty() {
            return Err(ClientError::ConfigurationError {
                message: "database.file cannot be empty".to_string(),
            });
        }

        if !self.decoder.executable.exists() {
            warn!(
                "Decoder executable does not exist yet: {}",
                self.decoder.executable.display()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_contract() {
        let cycles = CyclesConfig::default();
        assert_eq!(cycles.parser_interval, Duration::from_millis(100));
        assert_eq!(cycles.analyser_interval, Duration::from_secs(5));
        assert_eq!(cycles.sender_interval, Duration::from_secs(10));
        assert_eq!(cycles.batch_size, 1000);

        assert_eq!(default_port(), 31003);
        assert_eq!(default_database_file(), PathBuf::from("base.db"));
    }

    #[test]
    fn missing_required_api_keys_fail_validation() {
        let config = AppConfig {
            app: AppSection::default(),
            decoder: DecoderConfig {
                executable: PathBuf::from("/opt/decoder/uvd_rtl"),
                command_args: default_command_args(),
                host: default_host(),
                port: default_port(),
                timeout: default_decoder_timeout(),
                reconnect_delay: default_reconnect_delay(),
            },
            api: ApiConfig {
                url: "https://ingest.example.com/tracks".to_string(),
                status_url: "https://ingest.example.com/status".to_string(),
                client_id: 1,
                secret_key: String::new(),
                bearer_token: "token".to_string(),
                timeout: default_api_timeout(),
                ping_interval: default_ping_interval(),
            },
            database: DatabaseConfig::default(),
            cycles: CyclesConfig::default(),
        };

        assert!(config.validate().is_err());
    }
}
