//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use protocol::DeviceSpeed;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Listen address for USB/IP clients
    #[serde(default = "BridgeSettings::default_usbip_bind")]
    pub usbip_bind: String,
    /// Listen address for the bus simulator
    #[serde(default = "BridgeSettings::default_sim_bind")]
    pub sim_bind: String,
    #[serde(default = "BridgeSettings::default_log_level")]
    pub log_level: String,
    /// Bound on each wait for a simulator response (unset = wait forever)
    #[serde(default)]
    pub sim_response_timeout_ms: Option<u64>,
}

impl BridgeSettings {
    fn default_usbip_bind() -> String {
        "0.0.0.0:3240".to_string()
    }

    fn default_sim_bind() -> String {
        "0.0.0.0:2443".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn sim_response_timeout(&self) -> Option<Duration> {
        self.sim_response_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            usbip_bind: Self::default_usbip_bind(),
            sim_bind: Self::default_sim_bind(),
            log_level: Self::default_log_level(),
            sim_response_timeout_ms: None,
        }
    }
}

/// The one simulated device exported over USB/IP
///
/// # Example Configuration
/// ```toml
/// [device]
/// busnum = 47
/// devnum = 6
/// vendor_id = 0x16D0
/// product_id = 0x0F3B
///
/// [[device.interfaces]]
/// class = 0xFF
/// subclass = 0
/// protocol = 0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// sysfs path reported to clients
    #[serde(default)]
    pub path: String,
    #[serde(default = "DeviceSettings::default_busnum")]
    pub busnum: u32,
    /// Device number; also the bus address assigned at session start
    #[serde(default = "DeviceSettings::default_devnum")]
    pub devnum: u32,
    /// Kernel speed code (3 = high speed)
    #[serde(default = "DeviceSettings::default_speed")]
    pub speed: u32,
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: u16,
    #[serde(default)]
    pub bcd_device: u16,
    #[serde(default)]
    pub device_class: u8,
    #[serde(default)]
    pub device_subclass: u8,
    #[serde(default)]
    pub device_protocol: u8,
    #[serde(default)]
    pub configuration_value: u8,
    #[serde(default = "DeviceSettings::default_num_configurations")]
    pub num_configurations: u8,
    #[serde(default = "DeviceSettings::default_interfaces")]
    pub interfaces: Vec<InterfaceSettings>,
}

impl DeviceSettings {
    fn default_busnum() -> u32 {
        47
    }

    fn default_devnum() -> u32 {
        6
    }

    fn default_speed() -> u32 {
        3
    }

    fn default_vendor_id() -> u16 {
        0x16D0
    }

    fn default_product_id() -> u16 {
        0x0F3B
    }

    fn default_num_configurations() -> u8 {
        1
    }

    fn default_interfaces() -> Vec<InterfaceSettings> {
        vec![InterfaceSettings {
            class: 0xFF,
            subclass: 0,
            protocol: 0,
        }]
    }

    /// Bus id clients must import, e.g. "47-6.0"
    pub fn busid(&self) -> String {
        format!("{}-{}.0", self.busnum, self.devnum)
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            busnum: Self::default_busnum(),
            devnum: Self::default_devnum(),
            speed: Self::default_speed(),
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 0,
            num_configurations: Self::default_num_configurations(),
            interfaces: Self::default_interfaces(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSettings {
    pub class: u8,
    #[serde(default)]
    pub subclass: u8,
    #[serde(default)]
    pub protocol: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// wMaxPacketSize used for control and bulk pipes
    #[serde(default = "TransferSettings::default_max_packet_size")]
    pub max_packet_size: u16,
}

impl TransferSettings {
    fn default_max_packet_size() -> u16 {
        512
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_packet_size: Self::default_max_packet_size(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings::default(),
            device: DeviceSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-sim-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-sim-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usbip-sim-bridge/bridge.toml")
        }
    }

    /// Replace the port of either listen address
    pub fn override_ports(&mut self, usbip_port: Option<u16>, sim_port: Option<u16>) -> Result<()> {
        if let Some(port) = usbip_port {
            let mut addr = self.usbip_addr()?;
            addr.set_port(port);
            self.bridge.usbip_bind = addr.to_string();
        }
        if let Some(port) = sim_port {
            let mut addr = self.sim_addr()?;
            addr.set_port(port);
            self.bridge.sim_bind = addr.to_string();
        }
        Ok(())
    }

    pub fn usbip_addr(&self) -> Result<SocketAddr> {
        parse_bind(&self.bridge.usbip_bind, "usbip_bind")
    }

    pub fn sim_addr(&self) -> Result<SocketAddr> {
        parse_bind(&self.bridge.sim_bind, "sim_bind")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        self.usbip_addr()?;
        self.sim_addr()?;

        // The devnum doubles as the 7-bit bus address
        if !(1..=127).contains(&self.device.devnum) {
            return Err(anyhow!(
                "Invalid devnum {}, must be a bus address in 1..=127",
                self.device.devnum
            ));
        }

        if DeviceSpeed::from_u32(self.device.speed).is_none() {
            return Err(anyhow!(
                "Invalid speed {}, must be a kernel speed code in 0..=6",
                self.device.speed
            ));
        }

        if !(1..=1024).contains(&self.transfer.max_packet_size) {
            return Err(anyhow!(
                "Invalid max_packet_size {}, must be in 1..=1024",
                self.transfer.max_packet_size
            ));
        }

        let interfaces = self.device.interfaces.len();
        if interfaces == 0 || interfaces > u8::MAX as usize {
            return Err(anyhow!(
                "Device must have between 1 and 255 interfaces, found {}",
                interfaces
            ));
        }

        Ok(())
    }
}

fn parse_bind(value: &str, field: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| anyhow!("Invalid {} '{}': {}", field, value, e))
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
