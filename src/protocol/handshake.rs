use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{PluginError, Result};

/// Env var carrying the comma-separated generations the host offers
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

pub const DEFAULT_MAGIC_COOKIE_KEY: &str = "BACKEND_PLUGIN_MAGIC_COOKIE";
pub const DEFAULT_MAGIC_COOKIE_VALUE: &str = "2c5b7d0a8e3f4e6f9a1b";

/// Host-side settings for the startup handshake
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeConfig {
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    pub startup_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            magic_cookie_key: DEFAULT_MAGIC_COOKIE_KEY.to_string(),
            magic_cookie_value: DEFAULT_MAGIC_COOKIE_VALUE.to_string(),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

impl HandshakeConfig {
    /// Env entries every child receives so it can recognise the host.
    pub fn env(&self, offered: &BTreeSet<u32>) -> Vec<String> {
        let versions = offered
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        vec![
            format!("{}={}", self.magic_cookie_key, self.magic_cookie_value),
            format!("{PROTOCOL_VERSIONS_ENV}={versions}"),
        ]
    }

    /// Checks the cookie a child echoed back.
    pub fn verify(&self, handshake: &Handshake) -> Result<()> {
        if handshake.magic_cookie != self.magic_cookie_value {
            return Err(PluginError::HandshakeFailed(
                "magic cookie mismatch; is this a backend plugin executable?".into(),
            ));
        }
        Ok(())
    }
}

/// First frame a plugin writes after it starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub magic_cookie: String,
    pub protocol_version: u32,
    /// Identifier of the single object a generation-1 plugin serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    /// Capability names a generation-2 plugin dispenses
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Handshake {
    pub fn advertises(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
