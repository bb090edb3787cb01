use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::plugin::PluginDescriptor;
use crate::protocol::handshake::{DEFAULT_MAGIC_COOKIE_KEY, DEFAULT_MAGIC_COOKIE_VALUE};
use crate::protocol::HandshakeConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default, alias = "host_version")]
    pub host_version: String,
    #[serde(default, alias = "license_edition")]
    pub license_edition: String,
    #[serde(default)]
    pub handshake: HandshakeSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeSettings {
    #[serde(default = "default_magic_cookie_key", alias = "magic_cookie_key")]
    pub magic_cookie_key: String,
    #[serde(default = "default_magic_cookie_value", alias = "magic_cookie_value")]
    pub magic_cookie_value: String,
    #[serde(default = "default_startup_timeout", alias = "startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSettings {
    /// Interval between liveness checks of managed plugins
    #[serde(default = "default_tick", alias = "tick_ms")]
    pub tick_ms: u64,
    /// Time a plugin gets to exit after SIGTERM before it is killed
    #[serde(default = "default_stop_grace", alias = "stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            magic_cookie_key: default_magic_cookie_key(),
            magic_cookie_value: default_magic_cookie_value(),
            startup_timeout_ms: default_startup_timeout(),
        }
    }
}

impl HandshakeSettings {
    pub fn to_handshake(&self) -> HandshakeConfig {
        HandshakeConfig {
            magic_cookie_key: self.magic_cookie_key.clone(),
            magic_cookie_value: self.magic_cookie_value.clone(),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

impl SupervisorSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_magic_cookie_key() -> String {
    DEFAULT_MAGIC_COOKIE_KEY.to_string()
}

fn default_magic_cookie_value() -> String {
    DEFAULT_MAGIC_COOKIE_VALUE.to_string()
}

fn default_startup_timeout() -> u64 {
    10_000
}

fn default_tick() -> u64 {
    1_000
}

fn default_stop_grace() -> u64 {
    5_000
}
