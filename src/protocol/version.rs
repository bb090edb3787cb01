use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{PluginError, Result};

/// Lowest protocol generation the host accepts
pub const MINIMUM_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Single plugin object dispensed by plugin id; query and render only
    V1,
    /// Independently dispensed capability objects
    V2,
}

impl ProtocolVersion {
    /// Maps the generation a plugin reported during the handshake.
    ///
    /// Anything below the host minimum, or not in the set the host offered
    /// this plugin, is rejected. Generations above 2 speak the current
    /// capability layout.
    pub fn negotiate(reported: u32, offered: &BTreeSet<u32>) -> Result<Self> {
        let minimum = offered
            .iter()
            .next()
            .copied()
            .unwrap_or(MINIMUM_PROTOCOL_VERSION)
            .max(MINIMUM_PROTOCOL_VERSION);

        if reported < minimum || (!offered.is_empty() && !offered.contains(&reported)) {
            tracing::warn!(
                reported_version = reported,
                offered_versions = ?offered,
                "Plugin reports unsupported protocol version"
            );
            return Err(PluginError::UnsupportedProtocolVersion {
                version: reported,
                minimum,
            });
        }

        Ok(if reported <= 1 { Self::V1 } else { Self::V2 })
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    pub fn supports_resources(&self) -> bool {
        matches!(self, Self::V2)
    }

    pub fn supports_diagnostics(&self) -> bool {
        matches!(self, Self::V2)
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::V2)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u32())
    }
}

/// Generations offered to a plugin unless its descriptor narrows them
pub fn default_versions() -> BTreeSet<u32> {
    [1, 2].into_iter().collect()
}
