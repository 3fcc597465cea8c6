//! Configuration schema for serialbus
//!
//! Configuration is stored at `~/.config/serialbus/config.toml`

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Serial port registry settings
    pub serial: SerialConfig,

    /// In-process bus settings
    pub bus: BusConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: false,
        }
    }
}

/// Serial port registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Bus path of the serial manager; port objects live below it
    pub manager_path: String,

    /// Service name used when a bind request carries none
    pub default_service_name: String,

    /// Reject a device path already present in either collection
    pub unique_devices: bool,

    /// Number of RFCOMM device ids the allocator hands out
    pub max_devices: u16,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            manager_path: "/org/bluez/serial".to_string(),
            default_service_name: "Bluetooth RFCOMM port".to_string(),
            unique_devices: true,
            max_devices: 256,
        }
    }
}

/// In-process bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of objects the bus will publish
    pub max_objects: usize,

    /// Buffered signals per subscriber before it lags
    pub signal_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_objects: 1024,
            signal_capacity: 256,
        }
    }
}
