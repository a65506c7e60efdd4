//! Persisted board configuration.
//!
//! A JSON document next to a raw little-endian cell image holding the
//! default memory map. Versioning is by regeneration: unknown fields are
//! dropped on the next save.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kimcard_fdc::MAX_DRIVES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed configuration: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiConfig {
    pub country: String,
    pub ssid: String,
    pub password: String,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            country: "XX".to_string(),
            ssid: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoSystem {
    Pal,
    Ntsc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoConfig {
    pub system: VideoSystem,
    /// Framebuffer base; 2 KiB aligned, inside `0x2000..=0xD800`.
    pub address: u16,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            system: VideoSystem::Pal,
            address: 0x2000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterConfig {
    pub hsr: u16,
    pub dar: u16,
    pub msr: u16,
    pub udr: u16,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            hsr: 0xFFE8,
            dar: 0xFFE9,
            msr: 0xFFEE,
            udr: 0xFFEF,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub option_switch: bool,
    pub system_base: u16,
    pub user_base: u16,
    pub registers: RegisterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            option_switch: false,
            system_base: 0x2000,
            user_base: 0x4000,
            registers: RegisterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriveConfig {
    pub image: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MachineConfig {
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub drives: [Option<DriveConfig>; MAX_DRIVES],
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        fs::write(path, json)?;
        Ok(())
    }
}
