//! Plugin registry
//!
//! Maps plugin ids to their handles. Lookups heal exited plugins by
//! restarting them in place; shutdown stops everything concurrently.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::supervisor::{RunStatus, Supervisor};
use crate::error::{PluginError, Result};
use crate::instrumentation::PluginMetrics;
use crate::plugin::{
    BackendPlugin, CorePlugin, EnvFn, PluginDescriptor, ProcessHandle, StdioConnection,
};
use crate::protocol::{CapabilitySet, HandshakeConfig};

/// Builds a plugin handle from its descriptor and env callback
pub type PluginFactory =
    Arc<dyn Fn(PluginDescriptor, EnvFn) -> Result<Arc<dyn BackendPlugin>> + Send + Sync>;

/// Decides how a plugin is constructed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendFactoryProvider: Send + Sync {
    /// `None` when no implementation can host this plugin.
    async fn backend_factory(&self, descriptor: &PluginDescriptor) -> Option<PluginFactory>;
}

/// Supplies the environment for a plugin process.
pub trait PluginEnvProvider: Send + Sync {
    fn plugin_env(&self, descriptor: &PluginDescriptor) -> Vec<String>;
}

pub const HOST_VERSION_ENV: &str = "PLUGIN_HOST_VERSION";
pub const LICENSE_EDITION_ENV: &str = "PLUGIN_LICENSE_EDITION";

/// Host version and license edition, plus each plugin's own settings
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    pub host_version: String,
    pub license_edition: String,
}

impl PluginEnvProvider for HostEnv {
    fn plugin_env(&self, descriptor: &PluginDescriptor) -> Vec<String> {
        let mut env = vec![
            format!("{HOST_VERSION_ENV}={}", self.host_version),
            format!("{LICENSE_EDITION_ENV}={}", self.license_edition),
        ];
        env.extend(
            descriptor
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}")),
        );
        env
    }
}

/// Core plugins by id; everything else is launched from its executable.
pub struct DefaultFactoryProvider {
    core: BTreeMap<String, CapabilitySet>,
    handshake: HandshakeConfig,
    stop_grace: Duration,
    metrics: Arc<PluginMetrics>,
}

impl DefaultFactoryProvider {
    pub fn new(
        handshake: HandshakeConfig,
        stop_grace: Duration,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            core: BTreeMap::new(),
            handshake,
            stop_grace,
            metrics,
        }
    }

    /// Serves `id` from in-process handlers instead of an executable.
    pub fn with_core_plugin(mut self, id: impl Into<String>, capabilities: CapabilitySet) -> Self {
        self.core.insert(id.into(), capabilities);
        self
    }
}

#[async_trait]
impl BackendFactoryProvider for DefaultFactoryProvider {
    async fn backend_factory(&self, descriptor: &PluginDescriptor) -> Option<PluginFactory> {
        let metrics = self.metrics.clone();

        if let Some(capabilities) = self.core.get(&descriptor.id).cloned() {
            return Some(Arc::new(
                move |descriptor: PluginDescriptor, _env: EnvFn| -> Result<Arc<dyn BackendPlugin>> {
                    let plugin =
                        CorePlugin::new(descriptor.id, capabilities.clone(), metrics.clone())?;
                    Ok(Arc::new(plugin))
                },
            ));
        }

        if descriptor.executable.as_os_str().is_empty() {
            return None;
        }

        let handshake = self.handshake.clone();
        let stop_grace = self.stop_grace;
        Some(Arc::new(
            move |descriptor: PluginDescriptor, env: EnvFn| -> Result<Arc<dyn BackendPlugin>> {
                let connections = StdioConnection::factory(
                    descriptor.clone(),
                    env,
                    handshake.clone(),
                    stop_grace,
                );
                Ok(Arc::new(ProcessHandle::new(
                    descriptor,
                    connections,
                    metrics.clone(),
                )))
            },
        ))
    }
}

/// Ids with a registration in flight. Dropping the guard releases the id.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

pub struct Registry {
    plugins: RwLock<HashMap<String, Arc<dyn BackendPlugin>>>,
    pending: Mutex<HashSet<String>>,
    supervisor: Supervisor,
    provider: Arc<dyn BackendFactoryProvider>,
    env: Arc<dyn PluginEnvProvider>,
}

impl Registry {
    pub fn new(
        supervisor: Supervisor,
        provider: Arc<dyn BackendFactoryProvider>,
        env: Arc<dyn PluginEnvProvider>,
    ) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            supervisor,
            provider,
            env,
        }
    }

    /// The plugin registered as `id`, restarted first if it has exited.
    ///
    /// A failed restart reports `NotRegistered`; decommissioned plugins are
    /// never restarted. Restarts of one plugin never wait on another's.
    pub async fn get(&self, id: &str) -> Result<Arc<dyn BackendPlugin>> {
        let plugin = self.lookup(id).await?;
        if !plugin.exited().await {
            return Ok(plugin);
        }
        if plugin.is_decommissioned().await {
            return Err(PluginError::NotRegistered(id.to_string()));
        }

        match plugin.restart_if_exited().await {
            Ok(restarted) => {
                if restarted {
                    tracing::info!(plugin_id = %id, "Restarted plugin on lookup");
                }
                Ok(plugin)
            }
            Err(e) => {
                tracing::warn!(
                    plugin_id = %id,
                    error = %e,
                    "Failed to restart plugin on lookup"
                );
                Err(PluginError::NotRegistered(id.to_string()))
            }
        }
    }

    async fn lookup(&self, id: &str) -> Result<Arc<dyn BackendPlugin>> {
        self.plugins
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotRegistered(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }

    /// Whether a keep-alive loop is running for `id`.
    pub fn is_supervising(&self, id: &str) -> bool {
        self.supervisor.is_supervising(id)
    }

    /// Claims `id` for one registration, or fails with `Conflict` when it is
    /// registered or being registered.
    async fn reserve(&self, id: &str) -> Result<Reservation<'_>> {
        let plugins = self.plugins.read().await;
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| PluginError::Transport("registry state poisoned".into()))?;
        if plugins.contains_key(id) || !pending.insert(id.to_string()) {
            return Err(PluginError::Conflict(id.to_string()));
        }
        Ok(Reservation {
            pending: &self.pending,
            id: id.to_string(),
        })
    }

    /// Registers and, for managed plugins, starts `descriptor`.
    ///
    /// Nothing is left behind when any step fails. Of several concurrent
    /// registrations for one id, only the first gets past the conflict check.
    pub async fn register(&self, descriptor: PluginDescriptor) -> Result<()> {
        let id = descriptor.id.clone();
        let reservation = self.reserve(&id).await?;

        let factory = self
            .provider
            .backend_factory(&descriptor)
            .await
            .ok_or_else(|| PluginError::NoCompatibleImplementation(id.clone()))?;

        let env_provider = self.env.clone();
        let env_descriptor = descriptor.clone();
        let env: EnvFn = Arc::new(move || env_provider.plugin_env(&env_descriptor));

        let plugin = factory(descriptor, env)?;
        self.supervisor.start(plugin.clone()).await?;

        let mut plugins = self.plugins.write().await;
        plugins.insert(id.clone(), plugin);
        // Released only once the entry is visible to `reserve`.
        drop(reservation);
        tracing::info!(plugin_id = %id, "Plugin registered");
        Ok(())
    }

    /// Stops and removes `id`.
    ///
    /// The entry is removed even when stopping fails; the stop error is
    /// still returned.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let plugin = self
            .plugins
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PluginError::NotRegistered(id.to_string()))?;

        let stopped = self.supervisor.stop(plugin.as_ref()).await;
        if let Err(e) = &stopped {
            tracing::warn!(
                plugin_id = %id,
                error = %e,
                "Plugin deregistered but did not stop cleanly"
            );
        } else {
            tracing::info!(plugin_id = %id, "Plugin deregistered");
        }
        stopped
    }

    /// Starts a registered plugin on demand, surfacing any start error.
    pub async fn start_plugin(&self, id: &str) -> Result<()> {
        let plugin = self.lookup(id).await?;
        plugin.start().await
    }

    /// Stops every plugin concurrently and waits for all of them.
    pub async fn shutdown(&self) {
        let plugins: Vec<_> = self.plugins.read().await.values().cloned().collect();
        tracing::info!(count = plugins.len(), "Shutting down plugins");

        let stops = plugins.iter().map(|plugin| async move {
            if let Err(e) = self.supervisor.stop(plugin.as_ref()).await {
                tracing::error!(
                    plugin_id = %plugin.plugin_id(),
                    error = %e,
                    "Failed to stop plugin"
                );
            }
        });
        join_all(stops).await;
        self.supervisor.cancel_all();
    }

    /// Runs until `token` is cancelled, then shuts every plugin down.
    pub async fn run(&self, token: CancellationToken) -> Result<RunStatus> {
        token.cancelled().await;
        self.shutdown().await;
        Ok(RunStatus::Cancelled)
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
