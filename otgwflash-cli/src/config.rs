//! Configuration file support for otgwflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OTGWFLASH_*)
//! 3. Local config file (./otgwflash.toml)
//! 4. Global config file (~/.config/otgwflash/config.toml)
//!
//! A file given with `--config` replaces both config files.

use directories::ProjectDirs;
use log::{debug, info, warn};
use otgwflash::UpgradeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "otgwflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate of the gateway's serial interface.
    pub baud: Option<u32>,
}

/// Upgrade tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeSettings {
    /// Round-trip timeout in milliseconds.
    pub response_timeout_ms: Option<u64>,
    /// Reset pulse width in milliseconds.
    pub reset_pulse_ms: Option<u64>,
    /// Skip program blocks that are blank in the image.
    #[serde(default)]
    pub skip_blank_blocks: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upgrade settings.
    #[serde(default)]
    pub upgrade: UpgradeSettings,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otgwflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        if other.upgrade.response_timeout_ms.is_some() {
            self.upgrade.response_timeout_ms = other.upgrade.response_timeout_ms;
        }
        if other.upgrade.reset_pulse_ms.is_some() {
            self.upgrade.reset_pulse_ms = other.upgrade.reset_pulse_ms;
        }
        if other.upgrade.skip_blank_blocks {
            self.upgrade.skip_blank_blocks = true;
        }
    }

    /// Engine settings, with library defaults for anything unset.
    pub fn upgrade_config(&self) -> UpgradeConfig {
        let defaults = UpgradeConfig::default();
        UpgradeConfig {
            response_timeout: self
                .upgrade
                .response_timeout_ms
                .map_or(defaults.response_timeout, Duration::from_millis),
            reset_pulse: self
                .upgrade
                .reset_pulse_ms
                .map_or(defaults.reset_pulse, Duration::from_millis),
            skip_blank_blocks: self.upgrade.skip_blank_blocks,
        }
    }

    /// Remember `serial` in the local config file.
    pub fn save_port(serial: &str) -> anyhow::Result<()> {
        Self::save_port_to(Path::new(LOCAL_CONFIG), serial)
    }

    /// Remember `serial` in the config file at `path`, keeping its other settings.
    fn save_port_to(path: &Path, serial: &str) -> anyhow::Result<()> {
        let mut config = Self::load_from_file(path).unwrap_or_default();
        config.connection.serial = Some(serial.to_string());

        let content = toml::to_string_pretty(&config)?;
        fs::write(path, content)?;
        info!("Saved port configuration to {}", path.display());

        Ok(())
    }
}
