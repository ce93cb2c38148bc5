//! Daemon configuration loaded from a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::role::{BindPolicy, Role, RoleState};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/pingtun.toml";

pub const DEFAULT_MTU: u16 = 1400;
pub const MIN_MTU: u16 = 68;
/// Largest IP packet that still fits one IPv4 datagram after the IP and ICMP
/// headers of the outer packet.
pub const MAX_MTU: u16 = 65507;

/// Tunnel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub role: Role,

    /// Remote tunnel endpoint (initiator only)
    #[serde(default)]
    pub remote: Option<Ipv4Addr>,

    /// MTU of the virtual interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default)]
    pub dev: DevConfig,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[serde(default)]
    pub decode: DecodeConfig,
}

/// Virtual interface settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevConfig {
    #[serde(default = "default_dev_name")]
    pub name: String,

    /// Local point-to-point address
    #[serde(default)]
    pub local: Option<Ipv4Addr>,

    /// Remote point-to-point address
    #[serde(default)]
    pub peer: Option<Ipv4Addr>,

    /// Keep the 4-byte packet information header on the device
    #[serde(default)]
    pub packet_info: bool,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            name: default_dev_name(),
            local: None,
            peer: None,
            packet_info: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecodeConfig {
    /// Drop frames whose ICMP checksum does not verify
    #[serde(default = "default_true")]
    pub verify_checksum: bool,

    /// When a responder commits to its peer
    #[serde(default)]
    pub bind_on: BindPolicy,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            bind_on: BindPolicy::default(),
        }
    }
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_dev_name() -> String {
    "pingtun0".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Read a configuration file, apply `overrides` (command-line flags) and
    /// validate the result.
    pub fn load<P, F>(path: P, overrides: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Config),
    {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        overrides(&mut config);
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check role/remote consistency and value ranges.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        match (self.role, self.remote) {
            (Role::Initiator, None) => return Err(ConfigError::MissingRemote),
            (Role::Responder, Some(_)) => return Err(ConfigError::UnexpectedRemote),
            _ => {}
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::MtuOutOfRange(self.mtu));
        }
        if self.keepalive.interval_ms == 0 {
            return Err(ConfigError::ZeroKeepaliveInterval);
        }
        let name = &self.dev.name;
        if name.is_empty() || name.len() > 15 || name.contains('\0') || name.contains('/') {
            return Err(ConfigError::InvalidDeviceName(name.clone()));
        }
        Ok(())
    }

    /// Initial role state for the relay.
    pub fn role_state(&self) -> std::result::Result<RoleState, ConfigError> {
        match (self.role, self.remote) {
            (Role::Initiator, Some(remote)) => Ok(RoleState::initiator(remote)),
            (Role::Initiator, None) => Err(ConfigError::MissingRemote),
            (Role::Responder, None) => Ok(RoleState::responder()),
            (Role::Responder, Some(_)) => Err(ConfigError::UnexpectedRemote),
        }
    }

    /// Whether the keepalive scheduler runs for this configuration.
    pub fn keepalive_active(&self) -> bool {
        self.role == Role::Initiator && self.keepalive.enabled
    }
}
