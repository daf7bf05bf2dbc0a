//! # Configuration Management Module
//!
//! TOML configuration for the link core and the `meshlink` binary.
//!
//! ## Configuration Structure
//!
//! - [`RadioConfig`] - which transport to open and where
//! - [`QueueConfig`] - outbound packet queue timing
//! - [`RetryConfig`] - ack/nak retry cap, decision window and backoff
//! - [`ConnectionConfig`] - handshake, device sleep and heartbeat timing
//! - [`StorageConfig`] - where the node snapshot lives
//! - [`LoggingConfig`] - log level and optional file sink
//!
//! Every section and field has a default, so a partial file (or none at all) is valid.
//! The runtime components take the derived tuning structs ([`QueueTuning`], [`RetryTuning`],
//! [`ConnectionTuning`]) rather than the raw sections.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshlink.toml").await?;
//!     println!("Transport: {:?}", config.radio.kind);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [radio]
//! kind = "tcp"
//! tcp_address = "192.168.1.50:4403"
//!
//! [retry]
//! max_attempts = 2
//! decision_timeout_ms = 5000
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::connection::ConnectionTuning;
use crate::queue::QueueTuning;
use crate::retry::RetryTuning;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    Serial,
    Tcp,
    /// In-process simulated radio, useful for demos and tests.
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    #[serde(default = "default_radio_kind")]
    pub kind: RadioKind,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_tcp_address")]
    pub tcp_address: String,
}

fn default_radio_kind() -> RadioKind {
    RadioKind::Serial
}
fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_tcp_address() -> String {
    "127.0.0.1:4403".to_string()
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            kind: default_radio_kind(),
            port: default_port(),
            baud_rate: default_baud_rate(),
            tcp_address: default_tcp_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a dispatched packet waits for the radio's queue status.
    #[serde(default = "default_queue_status_timeout_ms")]
    pub status_timeout_ms: u64,
}

fn default_queue_status_timeout_ms() -> u64 {
    5000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            status_timeout_ms: default_queue_status_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts allowed after a MAX_RETRANSMIT nak.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Window for the user to answer a retry prompt; silence declines.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_decision_timeout_ms() -> u64 {
    5000
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            decision_timeout_ms: default_decision_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Added to the device's light-sleep interval before a sleeping radio is declared gone.
    #[serde(default = "default_sleep_margin_secs")]
    pub sleep_margin_secs: u64,
    #[serde(default = "default_config_timeout_ms")]
    pub config_timeout_ms: u64,
    #[serde(default = "default_config_attempts")]
    pub config_attempts: u32,
    /// Heartbeat period while connected; 0 disables.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_sleep_margin_secs() -> u64 {
    30
}
fn default_config_timeout_ms() -> u64 {
    10_000
}
fn default_config_attempts() -> u32 {
    3
}
fn default_heartbeat_secs() -> u64 {
    300
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            sleep_margin_secs: default_sleep_margin_secs(),
            config_timeout_ms: default_config_timeout_ms(),
            config_attempts: default_config_attempts(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.status_timeout_ms == 0 {
            return Err(anyhow!("queue.status_timeout_ms must be greater than zero"));
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(anyhow!(
                "retry.backoff_max_ms ({}) must be >= retry.backoff_base_ms ({})",
                self.retry.backoff_max_ms,
                self.retry.backoff_base_ms
            ));
        }
        if self.connection.config_attempts == 0 {
            return Err(anyhow!("connection.config_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn queue_tuning(&self) -> QueueTuning {
        QueueTuning {
            status_timeout: Duration::from_millis(self.queue.status_timeout_ms),
        }
    }

    pub fn retry_tuning(&self) -> RetryTuning {
        RetryTuning {
            max_attempts: self.retry.max_attempts,
            decision_timeout: Duration::from_millis(self.retry.decision_timeout_ms),
            backoff_base: Duration::from_millis(self.retry.backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry.backoff_max_ms),
        }
    }

    pub fn connection_tuning(&self) -> ConnectionTuning {
        ConnectionTuning {
            sleep_margin: Duration::from_secs(self.connection.sleep_margin_secs),
            config_timeout: Duration::from_millis(self.connection.config_timeout_ms),
            config_attempts: self.connection.config_attempts,
            heartbeat: if self.connection.heartbeat_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(self.connection.heartbeat_secs))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config.radio.kind, RadioKind::Serial);
        assert_eq!(config.queue.status_timeout_ms, 5000);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.connection.sleep_margin_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [radio]
            kind = "tcp"
            tcp_address = "10.0.0.2:4403"

            [connection]
            heartbeat_secs = 0
            "#,
        )
        .expect("parse");
        assert_eq!(config.radio.kind, RadioKind::Tcp);
        assert_eq!(config.radio.tcp_address, "10.0.0.2:4403");
        assert_eq!(config.radio.baud_rate, 115200);
        assert!(config.connection_tuning().heartbeat.is_none());
        assert_eq!(config.connection_tuning().config_attempts, 3);
    }

    #[test]
    fn backoff_bounds_are_validated() {
        let mut config = Config::default();
        config.retry.backoff_base_ms = 10_000;
        config.retry.backoff_max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tuning_converts_units() {
        let config = Config::default();
        assert_eq!(config.queue_tuning().status_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_tuning().decision_timeout, Duration::from_secs(5));
        assert_eq!(config.connection_tuning().sleep_margin, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn create_default_round_trips_through_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meshlink.toml");
        let path = path.to_str().expect("utf8 path");
        Config::create_default(path).await.expect("write");
        let loaded = Config::load(path).await.expect("load");
        assert_eq!(loaded.retry.decision_timeout_ms, 5000);
        assert_eq!(loaded.storage.data_dir, "./data");
    }
}
