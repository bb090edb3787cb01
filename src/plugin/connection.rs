//! Low-level connections to a plugin
//!
//! A [`Connection`] owns one child process (or a stand-in for one): it starts
//! it, performs the handshake, dispenses capability objects and kills it.
//! A fresh connection is created for every start.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::{privilege, EnvFn, PluginDescriptor};
use crate::backend::RenderHandler;
use crate::error::{PluginError, Result};
use crate::protocol::handshake::{Handshake, HandshakeConfig};
use crate::protocol::{Capability, CapabilityObject, LegacyPlugin, RemoteCapability, RpcChannel};

/// Capability name a generation-1 plugin serves its query object under
pub const LEGACY_DATASOURCE: &str = "datasource";

#[async_trait]
pub trait Connection: Send + Sync {
    /// Launches the plugin and completes the handshake, returning the
    /// protocol generation it reported.
    async fn start(&self) -> Result<u32>;

    /// `None` when the plugin does not serve `capability`.
    async fn dispense(&self, capability: Capability) -> Result<Option<CapabilityObject>>;

    /// Legacy single-object lookup by plugin id.
    async fn dispense_legacy(&self, plugin_id: &str) -> Result<Option<LegacyPlugin>>;

    /// True once the underlying process has terminated or was never started.
    fn exited(&self) -> bool;

    fn pid(&self) -> Option<u32>;

    async fn kill(&self) -> Result<()>;
}

/// Produces a fresh, unstarted connection for each start attempt
pub type ConnectionFactory = Arc<dyn Fn() -> Box<dyn Connection> + Send + Sync>;

struct Running {
    child: Child,
    channel: Arc<RpcChannel>,
    handshake: Handshake,
}

/// A plugin executable speaking length-prefixed frames over stdin/stdout
pub struct StdioConnection {
    descriptor: PluginDescriptor,
    env: EnvFn,
    handshake: HandshakeConfig,
    stop_grace: Duration,
    running: Mutex<Option<Running>>,
}

impl StdioConnection {
    pub fn new(
        descriptor: PluginDescriptor,
        env: EnvFn,
        handshake: HandshakeConfig,
        stop_grace: Duration,
    ) -> Self {
        Self {
            descriptor,
            env,
            handshake,
            stop_grace,
            running: Mutex::new(None),
        }
    }

    /// Builds a factory producing connections for `descriptor`.
    pub fn factory(
        descriptor: PluginDescriptor,
        env: EnvFn,
        handshake: HandshakeConfig,
        stop_grace: Duration,
    ) -> ConnectionFactory {
        Arc::new(move || {
            Box::new(StdioConnection::new(
                descriptor.clone(),
                env.clone(),
                handshake.clone(),
                stop_grace,
            )) as Box<dyn Connection>
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.descriptor.executable);
        cmd.args(&self.descriptor.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let entries = (self.env)()
            .into_iter()
            .chain(self.handshake.env(&self.descriptor.protocol_versions));
        for entry in entries {
            match entry.split_once('=') {
                Some((key, value)) => {
                    cmd.env(key, value);
                }
                None => {
                    tracing::warn!(
                        plugin_id = %self.descriptor.id,
                        entry = %entry,
                        "Ignoring malformed env entry"
                    );
                }
            }
        }

        cmd
    }

    fn session<T>(&self, f: impl FnOnce(&Running) -> T) -> Result<T> {
        let guard = self
            .running
            .lock()
            .map_err(|_| PluginError::Transport("connection state poisoned".into()))?;
        guard
            .as_ref()
            .map(f)
            .ok_or_else(|| PluginError::Unavailable(self.descriptor.id.clone()))
    }
}

#[async_trait]
impl Connection for StdioConnection {
    async fn start(&self) -> Result<u32> {
        let plugin_id = &self.descriptor.id;
        let mut child = self.command().spawn().map_err(|e| {
            PluginError::HandshakeFailed(format!(
                "failed to spawn {}: {e}",
                self.descriptor.executable.display()
            ))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::HandshakeFailed("plugin stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::HandshakeFailed("plugin stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(plugin_id.clone(), stderr));
        }

        let connected =
            RpcChannel::connect(plugin_id, stdout, stdin, self.handshake.startup_timeout).await;
        let (channel, handshake) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        if let Err(e) = self.handshake.verify(&handshake) {
            channel.close();
            let _ = child.kill().await;
            return Err(e);
        }

        if let Some(pid) = pid {
            privilege::warn_if_privileged(plugin_id, pid);
        }

        tracing::debug!(
            plugin_id = %plugin_id,
            pid = ?pid,
            protocol_version = handshake.protocol_version,
            capabilities = ?handshake.capabilities,
            "Plugin handshake complete"
        );

        let version = handshake.protocol_version;
        let mut running = self
            .running
            .lock()
            .map_err(|_| PluginError::Transport("connection state poisoned".into()))?;
        *running = Some(Running {
            child,
            channel: Arc::new(channel),
            handshake,
        });

        Ok(version)
    }

    async fn dispense(&self, capability: Capability) -> Result<Option<CapabilityObject>> {
        self.session(|running| {
            if !running.handshake.advertises(capability.name()) {
                return None;
            }
            let remote = Arc::new(RemoteCapability::new(
                running.channel.clone(),
                capability.name(),
            ));
            Some(match capability {
                Capability::Diagnostics => CapabilityObject::Diagnostics(remote),
                Capability::Resource => CapabilityObject::Resource(remote),
                Capability::Data => CapabilityObject::Data(remote),
                Capability::Transform => CapabilityObject::Transform(remote),
                Capability::Renderer => CapabilityObject::Renderer(remote),
                Capability::Stream => CapabilityObject::Stream(remote),
            })
        })
    }

    async fn dispense_legacy(&self, plugin_id: &str) -> Result<Option<LegacyPlugin>> {
        self.session(|running| {
            if running.handshake.plugin_id.as_deref() != Some(plugin_id) {
                return None;
            }
            let renderer = running
                .handshake
                .advertises(Capability::Renderer.name())
                .then(|| {
                    Arc::new(RemoteCapability::new(
                        running.channel.clone(),
                        Capability::Renderer.name(),
                    )) as Arc<dyn RenderHandler>
                });
            Some(LegacyPlugin {
                datasource: Arc::new(RemoteCapability::new(
                    running.channel.clone(),
                    LEGACY_DATASOURCE,
                )),
                renderer,
            })
        })
    }

    fn exited(&self) -> bool {
        let Ok(mut guard) = self.running.lock() else {
            return true;
        };
        match guard.as_mut() {
            None => true,
            Some(running) => {
                // Always poll the child so a dead one is reaped promptly.
                let reaped = !matches!(running.child.try_wait(), Ok(None));
                reaped || running.channel.is_closed()
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.session(|running| running.child.id()).ok().flatten()
    }

    async fn kill(&self) -> Result<()> {
        let taken = self
            .running
            .lock()
            .map_err(|_| PluginError::Transport("connection state poisoned".into()))?
            .take();
        let Some(mut running) = taken else {
            return Ok(());
        };

        running.channel.close();

        // `id` is gone once the child has been reaped; its pid may be reused.
        match running.child.id() {
            Some(pid) => {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::debug!(
                        plugin_id = %self.descriptor.id,
                        pid,
                        error = %e,
                        "SIGTERM failed"
                    );
                }
            }
            None => {
                tracing::debug!(plugin_id = %self.descriptor.id, "Plugin process already reaped");
            }
        }

        match tokio::time::timeout(self.stop_grace, running.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(
                    plugin_id = %self.descriptor.id,
                    status = %status,
                    "Plugin process exited"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(
                    plugin_id = %self.descriptor.id,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "Plugin ignored SIGTERM, killing"
                );
                running.child.kill().await?;
                Ok(())
            }
        }
    }
}

async fn forward_stderr(plugin_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(plugin_id = %plugin_id, "{}", line);
    }
}

#[cfg(all(test, unix))]
#[path = "connection_tests.rs"]
mod connection_tests;
