//! # Configuration Management Module
//!
//! Centralized configuration for the gateway, loaded from a TOML file with
//! serde, validated on load, and writable back out for the `init` command.
//!
//! ## Configuration Structure
//!
//! - [`GatewayConfig`] - device identity and data directory
//! - [`SerialConfig`] - pump controller link settings
//! - [`StoreConfig`] - transaction log ring sizing
//! - [`BrokerConfig`] - messaging transport and topic suffixes
//! - [`ApiConfig`] - remote settings/company/loss-query endpoints
//! - [`PipelineConfig`] - queue depths, retry and keep-alive tuning
//! - [`LinkConfig`] - WiFi/broker reconnect policy
//! - [`LoggingConfig`] - log level and optional file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! device_id = 1
//! nozzle_id = 101
//! device_topic = "disp01"
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//!
//! [broker]
//! host = "broker.example.net"
//! port = 1883
//!
//! [api]
//! base_url = "https://api.example.net"
//! ```
//!
//! Precedence: CLI args > config file > built-in defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub serial: SerialConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Controller-facing device id, carried in set-time frames.
    pub device_id: u8,
    /// Forecourt nozzle identity used to match inbound gap notifications.
    pub nozzle_id: u32,
    /// Device component of derived broker topics.
    pub device_topic: String,
    /// Directory for the transaction log and restart counter.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Optional GPIO value file toggled for the acknowledgment pulse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_gpio_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Controller turnaround delay after a write before reading (ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Poll loop cycle delay (ms); also paces the hardware watchdog feed.
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Ring capacity in records. One cycle of overwrite protection.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_broker_keep_alive")]
    pub keep_alive_secs: u64,
    /// Topic suffixes; the full topic is `{company}{suffix}{device_topic}`.
    #[serde(default = "default_txn_suffix")]
    pub txn_suffix: String,
    #[serde(default = "default_error_suffix")]
    pub error_suffix: String,
    #[serde(default = "default_restart_suffix")]
    pub restart_suffix: String,
    #[serde(default = "default_shift_suffix")]
    pub shift_suffix: String,
    #[serde(default = "default_mode_suffix")]
    pub mode_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL for the settings/company/loss-query collaborators.
    pub base_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_delivery_depth")]
    pub delivery_queue_depth: usize,
    #[serde(default = "default_loss_depth")]
    pub loss_queue_depth: usize,
    /// Publish attempts per record before dropping it.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
    /// Bounded dequeue wait in the delivery loop (ms).
    #[serde(default = "default_dequeue_wait_ms")]
    pub dequeue_wait_ms: u64,
    /// Idle window before a keep-alive poll of the serial link (s).
    #[serde(default = "default_idle_keepalive_secs")]
    pub idle_keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Network interface whose association we wait on.
    #[serde(default = "default_interface")]
    pub interface: String,
    /// WiFi association attempts per retry cycle.
    #[serde(default = "default_wifi_retry_limit")]
    pub wifi_retry_limit: u32,
    #[serde(default = "default_wifi_retry_delay_ms")]
    pub wifi_retry_delay_ms: u64,
    /// Consecutive exhausted retry cycles before a full restart.
    #[serde(default = "default_max_retry_cycles")]
    pub max_retry_cycles: u32,
    #[serde(default = "default_broker_retry_delay_ms")]
    pub broker_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_settle_delay_ms() -> u64 {
    120
}
fn default_cycle_delay_ms() -> u64 {
    50
}
fn default_capacity() -> u64 {
    5000
}
fn default_client_id() -> String {
    "pumpgate".to_string()
}
fn default_broker_keep_alive() -> u64 {
    30
}
fn default_txn_suffix() -> String {
    "/txn/".to_string()
}
fn default_error_suffix() -> String {
    "/err/".to_string()
}
fn default_restart_suffix() -> String {
    "/restart/".to_string()
}
fn default_shift_suffix() -> String {
    "/shift/".to_string()
}
fn default_mode_suffix() -> String {
    "/mode/".to_string()
}
fn default_api_timeout() -> u64 {
    10
}
fn default_delivery_depth() -> usize {
    64
}
fn default_loss_depth() -> usize {
    32
}
fn default_publish_attempts() -> u32 {
    3
}
fn default_publish_backoff_ms() -> u64 {
    500
}
fn default_dequeue_wait_ms() -> u64 {
    1000
}
fn default_idle_keepalive_secs() -> u64 {
    300
}
fn default_interface() -> String {
    "wlan0".to_string()
}
fn default_wifi_retry_limit() -> u32 {
    10
}
fn default_wifi_retry_delay_ms() -> u64 {
    2000
}
fn default_max_retry_cycles() -> u32 {
    20
}
fn default_broker_retry_delay_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            nozzle_id: 101,
            device_topic: "disp01".to_string(),
            data_dir: default_data_dir(),
            ack_gpio_path: None,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            settle_delay_ms: default_settle_delay_ms(),
            cycle_delay_ms: default_cycle_delay_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: default_client_id(),
            keep_alive_secs: default_broker_keep_alive(),
            txn_suffix: default_txn_suffix(),
            error_suffix: default_error_suffix(),
            restart_suffix: default_restart_suffix(),
            shift_suffix: default_shift_suffix(),
            mode_suffix: default_mode_suffix(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.net".to_string(),
            timeout_secs: default_api_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delivery_queue_depth: default_delivery_depth(),
            loss_queue_depth: default_loss_depth(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
            dequeue_wait_ms: default_dequeue_wait_ms(),
            idle_keepalive_secs: default_idle_keepalive_secs(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            wifi_retry_limit: default_wifi_retry_limit(),
            wifi_retry_delay_ms: default_wifi_retry_delay_ms(),
            max_retry_cycles: default_max_retry_cycles(),
            broker_retry_delay_ms: default_broker_retry_delay_ms(),
        }
    }
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
    /// Load configuration from a TOML file and validate it.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("cannot read config {}: {}", path, e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| anyhow!("invalid config {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Write a starter configuration file with defaults.
    pub async fn create_default(path: &str) -> Result<()> {
        let serialized = toml::to_string_pretty(&Config::default())?;
        fs::write(path, serialized).await?;
        Ok(())
    }

    /// Validate values that serde's types cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.store.capacity == 0 {
            return Err(anyhow!("store.capacity must be at least 1"));
        }
        if self.pipeline.publish_attempts == 0 {
            return Err(anyhow!("pipeline.publish_attempts must be at least 1"));
        }
        if self.pipeline.delivery_queue_depth == 0 || self.pipeline.loss_queue_depth == 0 {
            return Err(anyhow!("queue depths must be at least 1"));
        }
        if self.gateway.device_topic.trim().is_empty() {
            return Err(anyhow!("gateway.device_topic must not be empty"));
        }
        if self.link.max_retry_cycles == 0 {
            return Err(anyhow!("link.max_retry_cycles must be at least 1"));
        }
        Ok(())
    }

    /// Path of the transaction log ring file.
    pub fn txn_log_path(&self) -> String {
        format!("{}/txnlog.bin", self.gateway.data_dir)
    }

    /// Path of the persisted restart counter.
    pub fn restart_counter_path(&self) -> String {
        format!("{}/restarts", self.gateway.data_dir)
    }
}
