//! Keep-alive loop for managed plugins
//!
//! Each managed plugin gets one background task that polls on a fixed tick
//! and restarts the plugin whenever it finds it exited. The loop ends when
//! the plugin is decommissioned or the host shuts down.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::plugin::BackendPlugin;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// How a keep-alive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Host shutdown or an explicit stop
    Cancelled,
    /// The plugin was retired
    Decommissioned,
}

struct KeepAlive {
    plugin: Arc<dyn BackendPlugin>,
    cancel: CancellationToken,
    task: JoinHandle<RunStatus>,
}

impl KeepAlive {
    /// Whether this loop supervises exactly `plugin`, not just its id.
    fn owned_by(&self, plugin: &dyn BackendPlugin) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.plugin) as *const (),
            plugin as *const _ as *const (),
        )
    }
}

pub struct Supervisor {
    tick: Duration,
    shutdown: CancellationToken,
    loops: DashMap<String, KeepAlive>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl Supervisor {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            shutdown: CancellationToken::new(),
            loops: DashMap::new(),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Starts a managed plugin and keeps it alive in the background.
    ///
    /// Unmanaged plugins are left alone; their callers start them.
    pub async fn start(&self, plugin: Arc<dyn BackendPlugin>) -> Result<()> {
        if !plugin.is_managed() {
            return Ok(());
        }

        plugin.start().await?;

        let id = plugin.plugin_id().to_string();
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(keep_alive(plugin.clone(), self.tick, cancel.clone()));

        let keep_alive = KeepAlive {
            plugin,
            cancel,
            task,
        };
        if let Some(previous) = self.loops.insert(id, keep_alive) {
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Retires `plugin`, stops it and waits for its keep-alive loop to end.
    ///
    /// A loop registered under the same id for a different plugin is left
    /// running.
    pub async fn stop(&self, plugin: &dyn BackendPlugin) -> Result<()> {
        // Decommission first so the loop cannot restart what we are stopping.
        plugin.decommission().await;
        let stopped = plugin.stop().await;

        let removed = self
            .loops
            .remove_if(plugin.plugin_id(), |_, keep_alive| keep_alive.owned_by(plugin));
        if let Some((_, keep_alive)) = removed {
            keep_alive.cancel.cancel();
            match keep_alive.task.await {
                Ok(status) => {
                    tracing::debug!(
                        plugin_id = %plugin.plugin_id(),
                        status = ?status,
                        "Keep-alive loop ended"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        plugin_id = %plugin.plugin_id(),
                        error = %e,
                        "Keep-alive loop failed"
                    );
                }
            }
        }

        stopped
    }

    /// Cancels every keep-alive loop.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    pub fn is_supervising(&self, plugin_id: &str) -> bool {
        self.loops.contains_key(plugin_id)
    }
}

async fn keep_alive(
    plugin: Arc<dyn BackendPlugin>,
    tick: Duration,
    cancel: CancellationToken,
) -> RunStatus {
    let plugin_id = plugin.plugin_id().to_string();
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(plugin_id = %plugin_id, "Keep-alive loop cancelled");
                return RunStatus::Cancelled;
            }
            _ = ticker.tick() => {}
        }

        if plugin.is_decommissioned().await {
            tracing::debug!(
                plugin_id = %plugin_id,
                "Plugin decommissioned, leaving keep-alive loop"
            );
            return RunStatus::Decommissioned;
        }

        if !plugin.exited().await {
            continue;
        }

        tracing::info!(plugin_id = %plugin_id, "Restarting exited plugin");
        match plugin.restart_if_exited().await {
            Ok(true) => {
                tracing::info!(plugin_id = %plugin_id, "Plugin restarted");
            }
            Ok(false) => {
                tracing::debug!(plugin_id = %plugin_id, "Plugin already restarted");
            }
            Err(e) => {
                tracing::error!(plugin_id = %plugin_id, error = %e, "Failed to restart plugin");
            }
        }
    }
}
