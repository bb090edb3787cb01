//! Single-plugin lifecycle and protocol negotiation
//!
//! A [`ProcessHandle`] owns at most one live [`Connection`]. `start` replaces
//! it with a fresh one, negotiates the protocol generation and builds the
//! matching client. Capability calls never restart anything: when the plugin
//! is not running they fail with `Unavailable` and the caller decides.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::connection::{Connection, ConnectionFactory};
use super::{BackendPlugin, PluginDescriptor};
use crate::backend::{
    CallResourceRequest, CallResourceResponseSender, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, PluginClient, PublishStreamRequest,
    PublishStreamResponse, QueryDataRequest, QueryDataResponse, RenderRequest, RenderResponse,
    RunStreamRequest, StreamPacketSender, SubscribeStreamRequest, SubscribeStreamResponse,
};
use crate::error::{PluginError, Result};
use crate::instrumentation::PluginMetrics;
use crate::protocol::{
    Capability, CapabilitySet, ClientV1, ClientV2, ProtocolClient, ProtocolVersion,
};
use crate::stream::ResourceStream;

#[derive(Default)]
struct HandleState {
    connection: Option<Box<dyn Connection>>,
    client: Option<Arc<dyn ProtocolClient>>,
    decommissioned: bool,
}

pub struct ProcessHandle {
    descriptor: PluginDescriptor,
    factory: ConnectionFactory,
    metrics: Arc<PluginMetrics>,
    state: RwLock<HandleState>,
}

impl ProcessHandle {
    pub fn new(
        descriptor: PluginDescriptor,
        factory: ConnectionFactory,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            descriptor,
            factory,
            metrics,
            state: RwLock::new(HandleState::default()),
        }
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Generation of the running plugin, if any
    pub async fn protocol_version(&self) -> Option<ProtocolVersion> {
        let state = self.state.read().await;
        state.client.as_ref().map(|client| client.protocol_version())
    }

    pub async fn pid(&self) -> Option<u32> {
        let state = self.state.read().await;
        state.connection.as_ref().and_then(|conn| conn.pid())
    }

    pub async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.client().await?.transform_data(req).await
    }

    pub async fn render(&self, req: RenderRequest) -> Result<RenderResponse> {
        self.client().await?.render(req).await
    }

    /// Raw response stream for a resource call. A plugin without a resource
    /// capability yields a single 501 response.
    pub async fn resource_stream(
        &self,
        req: CallResourceRequest,
    ) -> Result<Box<dyn ResourceStream>> {
        self.client().await?.resource_stream(req).await
    }

    /// The current client, provided the plugin is running.
    async fn client(&self) -> Result<Arc<dyn ProtocolClient>> {
        let state = self.state.read().await;
        match (&state.connection, &state.client) {
            (Some(connection), Some(client)) if !connection.exited() => Ok(client.clone()),
            _ => Err(PluginError::Unavailable(self.descriptor.id.clone())),
        }
    }

    async fn negotiate(&self, connection: &dyn Connection) -> Result<Arc<dyn ProtocolClient>> {
        let plugin_id = &self.descriptor.id;
        let reported = connection.start().await?;
        let version = ProtocolVersion::negotiate(reported, &self.descriptor.protocol_versions)?;

        let client: Arc<dyn ProtocolClient> = match version {
            ProtocolVersion::V1 => {
                let legacy = connection.dispense_legacy(plugin_id).await?.ok_or_else(|| {
                    PluginError::NoCompatibleImplementation(plugin_id.clone())
                })?;
                Arc::new(ClientV1::new(plugin_id, legacy, self.metrics.clone()))
            }
            ProtocolVersion::V2 => {
                let mut capabilities = CapabilitySet::default();
                for capability in Capability::ALL {
                    if let Some(object) = connection.dispense(capability).await? {
                        capabilities.insert(object);
                    }
                }
                if capabilities.is_empty() {
                    return Err(PluginError::NoCompatibleImplementation(plugin_id.clone()));
                }
                tracing::debug!(
                    plugin_id = %plugin_id,
                    capabilities = ?capabilities.names(),
                    "Dispensed plugin capabilities"
                );
                Arc::new(ClientV2::new(plugin_id, capabilities, self.metrics.clone()))
            }
        };

        tracing::info!(
            plugin_id = %plugin_id,
            pid = ?connection.pid(),
            protocol_version = %version,
            "Plugin started"
        );
        Ok(client)
    }

    /// Replaces the current connection with a freshly negotiated one.
    /// Callers hold the state write lock.
    async fn start_locked(&self, state: &mut HandleState) -> Result<()> {
        if state.decommissioned {
            return Err(PluginError::Unavailable(self.descriptor.id.clone()));
        }

        state.client = None;
        if let Some(previous) = state.connection.take() {
            if let Err(e) = previous.kill().await {
                tracing::debug!(
                    plugin_id = %self.descriptor.id,
                    error = %e,
                    "Failed to kill previous plugin process"
                );
            }
        }

        let connection = (self.factory)();
        match self.negotiate(connection.as_ref()).await {
            Ok(client) => {
                state.connection = Some(connection);
                state.client = Some(client);
                Ok(())
            }
            Err(e) => {
                if let Err(kill_err) = connection.kill().await {
                    tracing::debug!(
                        plugin_id = %self.descriptor.id,
                        error = %kill_err,
                        "Failed to kill plugin after failed start"
                    );
                }
                Err(e)
            }
        }
    }
}

fn connection_exited(state: &HandleState) -> bool {
    state
        .connection
        .as_ref()
        .map_or(true, |connection| connection.exited())
}

#[async_trait]
impl BackendPlugin for ProcessHandle {
    fn plugin_id(&self) -> &str {
        &self.descriptor.id
    }

    fn is_managed(&self) -> bool {
        self.descriptor.managed
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.start_locked(&mut state).await
    }

    async fn restart_if_exited(&self) -> Result<bool> {
        let mut state = self.state.write().await;
        // Another caller may have restarted it while we waited for the lock.
        if !connection_exited(&state) {
            return Ok(false);
        }
        self.start_locked(&mut state).await.map(|()| true)
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.client = None;
        match state.connection.take() {
            Some(connection) => {
                connection.kill().await?;
                tracing::info!(plugin_id = %self.descriptor.id, "Plugin stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn exited(&self) -> bool {
        connection_exited(&*self.state.read().await)
    }

    async fn decommission(&self) {
        self.state.write().await.decommissioned = true;
    }

    async fn is_decommissioned(&self) -> bool {
        self.state.read().await.decommissioned
    }
}

#[async_trait]
impl PluginClient for ProcessHandle {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.client().await?.query_data(req).await
    }

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        self.client().await?.call_resource(req, sender).await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        self.client().await?.check_health(req).await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        self.client().await?.collect_metrics(req).await
    }

    async fn subscribe_stream(
        &self,
        req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        self.client().await?.subscribe_stream(req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        self.client().await?.publish_stream(req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        self.client().await?.run_stream(req, sender).await
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod process_tests;
