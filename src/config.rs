use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Log every event bus publish (target `WAT::EVENTS`)
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default)]
    pub wat: WatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Transfer saga settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatConfig {
    #[serde(default = "default_device_id")]
    pub device_id: u32,
    #[serde(default = "default_log_capacity")]
    pub off_log_capacity: usize,
    #[serde(default = "default_log_capacity")]
    pub on_log_capacity: usize,
    /// Upper bound on waiting for the ledger reservation
    #[serde(default = "default_reservation_timeout_ms")]
    pub reservation_timeout_ms: u64,
    /// Credit meter ceiling for transfers on (minor units); none = unlimited
    #[serde(default)]
    pub max_credit_meter: Option<u64>,
    /// Machine-initiated transfers off accept a reduced authorization
    #[serde(default)]
    pub allow_reduced_off_amounts: bool,
}

fn default_device_id() -> u32 {
    1
}

fn default_log_capacity() -> usize {
    100
}

fn default_reservation_timeout_ms() -> u64 {
    5000
}

impl Default for WatConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            off_log_capacity: default_log_capacity(),
            on_log_capacity: default_log_capacity(),
            reservation_timeout_ms: default_reservation_timeout_ms(),
            max_credit_meter: None,
            allow_reduced_off_amounts: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: "./data/wat".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
