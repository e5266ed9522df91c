//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use common::LOG_LEVELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usb_helper::{HelperSettings, InterfaceClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    /// Helper tunables
    #[serde(default)]
    pub usb: HelperSettings,
    /// Devices opened at startup
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Time between two mainloop ticks
    #[serde(default = "DaemonSettings::default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl DaemonSettings {
    fn default_tick_interval() -> u64 {
        10
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// One device to open, claim and read from
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// path = "/sys/bus/usb/devices/3-2"
/// claim = { class = 3, subclass = 0, protocol = 0 }
/// endpoint = 0x81
/// length = 64
/// report_index = 2
/// init_report = [0x87, 0x03, 0x08, 0x07]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device path as the device monitor reports it
    pub path: String,
    /// Interfaces to claim before reading
    #[serde(default)]
    pub claim: Option<InterfaceClass>,
    /// Interrupt endpoint to read from
    #[serde(default = "DeviceConfig::default_endpoint")]
    pub endpoint: u8,
    /// Bytes per interrupt read
    #[serde(default = "DeviceConfig::default_length")]
    pub length: usize,
    /// Interface a feature request is sent to
    #[serde(default)]
    pub report_index: Option<u16>,
    /// Feature report exchanged once after opening
    #[serde(default)]
    pub init_report: Option<Vec<u8>>,
}

impl DeviceConfig {
    fn default_endpoint() -> u8 {
        1
    }

    fn default_length() -> usize {
        64
    }

    /// Device given on the command line: read with the defaults, claim nothing
    pub fn for_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            claim: None,
            endpoint: Self::default_endpoint(),
            length: Self::default_length(),
            report_index: None,
            init_report: None,
        }
    }

    /// Path with a leading `~` expanded
    pub fn expanded_path(&self) -> String {
        shellexpand::tilde(&self.path).into_owned()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                log_level: "info".to_string(),
                tick_interval_ms: DaemonSettings::default_tick_interval(),
            },
            usb: HelperSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-inputd/daemon.toml"),
            ];
            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
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
            config_dir.join("usb-inputd").join("daemon.toml")
        } else {
            PathBuf::from(".config/usb-inputd/daemon.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.daemon.tick_interval_ms == 0 {
            return Err(anyhow!("tick_interval_ms must be greater than 0"));
        }

        for device in &self.devices {
            Self::validate_device(device)?;
        }

        Ok(())
    }

    fn validate_device(device: &DeviceConfig) -> Result<()> {
        if device.path.is_empty() {
            return Err(anyhow!("Empty device path in devices list"));
        }
        if device.length == 0 {
            return Err(anyhow!(
                "Invalid read length 0 for device '{}'",
                device.path
            ));
        }
        if device.init_report.is_some() && device.report_index.is_none() {
            return Err(anyhow!(
                "Device '{}' has init_report but no report_index",
                device.path
            ));
        }
        Ok(())
    }
}

/// Load a configuration file given on the command line, expanding `~`
pub fn load_config(path: &str) -> Result<DaemonConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DaemonConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.tick_interval(), Duration::from_millis(10));
        assert_eq!(config.usb, HelperSettings::default());
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_devices() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [daemon]
            log_level = "debug"

            [usb]
            deferred_queue_limit = 128

            [[devices]]
            path = "/sys/bus/usb/devices/3-2"
            claim = { class = 3, subclass = 0, protocol = 0 }
            endpoint = 0x81
            report_index = 2
            init_report = [0x87, 0x03]

            [[devices]]
            path = "/hidapi/dev/hidraw0"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.daemon.tick_interval_ms, 10);
        assert_eq!(config.usb.deferred_queue_limit, 128);
        assert_eq!(config.usb.control_timeout_ms, 500);
        assert_eq!(config.devices.len(), 2);

        let pad = &config.devices[0];
        assert_eq!(
            pad.claim,
            Some(InterfaceClass {
                class: 3,
                subclass: 0,
                protocol: 0
            })
        );
        assert_eq!(pad.endpoint, 0x81);
        assert_eq!(pad.length, 64);
        assert_eq!(pad.init_report, Some(vec![0x87, 0x03]));

        assert_eq!(config.devices[1], DeviceConfig::for_path("/hidapi/dev/hidraw0"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DaemonConfig::default();
        config.daemon.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.daemon.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_tick_interval() {
        let mut config = DaemonConfig::default();
        config.daemon.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_devices() {
        let mut config = DaemonConfig::default();
        config.devices.push(DeviceConfig {
            length: 0,
            ..DeviceConfig::for_path("/win32/usb/1/2")
        });
        assert!(config.validate().is_err());

        config.devices[0] = DeviceConfig {
            init_report: Some(vec![1]),
            ..DeviceConfig::for_path("/win32/usb/1/2")
        };
        assert!(config.validate().is_err());

        config.devices[0].report_index = Some(0);
        assert!(config.validate().is_ok());

        config.devices[0].path.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.toml");

        let mut config = DaemonConfig::default();
        config.daemon.log_level = "warn".to_string();
        config.devices.push(DeviceConfig {
            claim: Some(InterfaceClass {
                class: 3,
                subclass: 0,
                protocol: 0,
            }),
            ..DeviceConfig::for_path("/win32/usb/1/2")
        });
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.daemon.log_level, "warn");
        assert_eq!(loaded.devices, config.devices);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[daemon]\nlog_level = \"loud\"\n").unwrap();
        assert!(DaemonConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_expanded_path() {
        let device = DeviceConfig::for_path("/dev/hidraw0");
        assert_eq!(device.expanded_path(), "/dev/hidraw0");

        let device = DeviceConfig::for_path("~/fake-sysfs/3-2");
        assert!(!device.expanded_path().starts_with('~') || dirs::home_dir().is_none());
    }
}
