//! Plugin handles
//!
//! A [`BackendPlugin`] is the unit the registry and supervisor manage. Out of
//! process plugins are [`ProcessHandle`]s over a [`Connection`]; in-process
//! ones are [`CorePlugin`]s.

pub mod connection;
pub mod core_plugin;
pub mod privilege;
pub mod process;

pub use connection::{Connection, ConnectionFactory, StdioConnection};
pub use core_plugin::CorePlugin;
pub use process::ProcessHandle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::PluginClient;
use crate::error::Result;
use crate::protocol::version::default_versions;

/// Computes the environment handed to a plugin process, as `KEY=VALUE`
/// entries. Called again on every start.
pub type EnvFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Static description of a plugin to register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: String,
    #[serde(default)]
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Managed plugins are started and kept alive by the host
    #[serde(default = "default_managed")]
    pub managed: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Protocol generations offered to this plugin
    #[serde(default = "default_versions")]
    pub protocol_versions: BTreeSet<u32>,
}

fn default_managed() -> bool {
    true
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            args: Vec::new(),
            managed: true,
            env: BTreeMap::new(),
            protocol_versions: default_versions(),
        }
    }

    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A plugin the host can start, stop and call.
#[async_trait]
pub trait BackendPlugin: PluginClient {
    fn plugin_id(&self) -> &str;

    fn is_managed(&self) -> bool;

    async fn start(&self) -> Result<()>;

    /// Safe to call when already stopped.
    async fn stop(&self) -> Result<()>;

    /// True when nothing is running behind this handle.
    async fn exited(&self) -> bool;

    /// Starts the plugin only if it has exited, returning whether it did.
    ///
    /// Concurrent callers that all saw the plugin exited restart it once.
    async fn restart_if_exited(&self) -> Result<bool> {
        if !self.exited().await {
            return Ok(false);
        }
        self.start().await.map(|()| true)
    }

    /// Permanently retires the plugin from restarts.
    async fn decommission(&self);

    async fn is_decommissioned(&self) -> bool;
}
