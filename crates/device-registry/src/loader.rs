//! Gateway configuration file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thingset::store::derive_device_id;
use thingset::GatewayInfo;

use crate::decode::NodeTable;
use crate::types::{DEFAULT_CAPACITY, SELF_NAME};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct GatewayConfig {
    pub registry: RegistryConfig,
    pub self_device: SelfDeviceConfig,
    pub serial: SerialConfig,
    pub can: CanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct RegistryConfig {
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct SelfDeviceConfig {
    /// Name the gateway is listed under.
    pub device_type: String,
    pub manufacturer: String,
    pub firmware_version: String,
    /// Fixed id; derived from `hardware_id` when absent.
    pub device_id: Option<String>,
    /// 48-bit hardware address, typically the MAC.
    pub hardware_id: u64,
}

impl Default for SelfDeviceConfig {
    fn default() -> Self {
        Self {
            device_type: SELF_NAME.to_string(),
            manufacturer: "Libre Solar".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            device_id: None,
            hardware_id: 0,
        }
    }
}

impl SelfDeviceConfig {
    pub fn device_id(&self) -> String {
        self.device_id
            .clone()
            .unwrap_or_else(|| derive_device_id(self.hardware_id))
    }

    pub fn gateway_info(&self) -> GatewayInfo {
        GatewayInfo {
            device_id: self.device_id(),
            manufacturer: self.manufacturer.clone(),
            firmware_version: self.firmware_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub resolve_timeout_ms: u64,
    pub resolve_attempts: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout_ms: 200,
            resolve_timeout_ms: 500,
            resolve_attempts: 2,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum CanBackend {
    #[default]
    Mock,
    Slcan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct CanConfig {
    pub enabled: bool,
    pub backend: CanBackend,
    pub interface: String,
    pub bitrate: u32,
    pub client_address: u8,
    pub timeout_ms: u64,
    /// CBOR requests when set, unterminated text otherwise.
    pub binary: bool,
    pub node_tables: Vec<NodeTable>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: CanBackend::Mock,
            interface: "mock0".to_string(),
            bitrate: 500_000,
            client_address: 0xF1,
            timeout_ms: 500,
            binary: true,
            node_tables: vec![NodeTable::bms(), NodeTable::mppt()],
        }
    }
}

impl CanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl GatewayConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let val: Value = serde_yaml::from_str(raw).context("parsing yaml")?;
        if val.is_null() {
            return Ok(Self::default());
        }
        let cfg: GatewayConfig = serde_yaml::from_value(val).context("decoding gateway config")?;
        Ok(cfg)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<GatewayConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    GatewayConfig::from_yaml_str(&raw).with_context(|| format!("loading config: {}", path.display()))
}
