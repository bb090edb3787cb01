use std::io;
use thiserror::Error;

/// Every failure the plugin host can report.
///
/// `MethodNotImplemented` and `Unavailable` are routine outcomes: callers are
/// expected to branch on them rather than treat them as faults.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not registered: {0}")]
    NotRegistered(String),

    #[error("Plugin unavailable: {0}")]
    Unavailable(String),

    #[error("Method not implemented")]
    MethodNotImplemented,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unsupported protocol version {version} (minimum {minimum})")]
    UnsupportedProtocolVersion { version: u32, minimum: u32 },

    #[error("No compatible plugin implementation found for {0}")]
    NoCompatibleImplementation(String),

    #[error("Plugin already registered: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Plugin returned an error ({code}): {message}")]
    Downstream { code: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream drained")]
    StreamDrained,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

impl PluginError {
    /// True for outcomes callers handle as normal control flow.
    pub fn is_routine(&self) -> bool {
        matches!(self, Self::MethodNotImplemented | Self::Unavailable(_))
    }

    /// True when a stream ended normally.
    pub fn is_drained(&self) -> bool {
        matches!(self, Self::StreamDrained)
    }

    /// Folds a downstream "unimplemented" report into `MethodNotImplemented`
    /// so callers see one signal however the capability went missing.
    pub fn normalize(self) -> Self {
        match self {
            Self::Downstream { code, .. } if code == UNIMPLEMENTED_CODE => {
                Self::MethodNotImplemented
            }
            other => other,
        }
    }
}

/// Error code a plugin reports for a method it does not serve
pub const UNIMPLEMENTED_CODE: &str = "unimplemented";

pub type Result<T> = std::result::Result<T, PluginError>;
