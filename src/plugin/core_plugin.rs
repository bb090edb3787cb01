//! In-process plugins
//!
//! A core plugin is compiled into the host. It has nothing to launch, so
//! start and stop are no-ops and it never exits, but it answers through the
//! same client as an out-of-process plugin.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::BackendPlugin;
use crate::backend::{
    CallResourceRequest, CallResourceResponseSender, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, PluginClient, PublishStreamRequest,
    PublishStreamResponse, QueryDataRequest, QueryDataResponse, RenderRequest, RenderResponse,
    RunStreamRequest, StreamPacketSender, SubscribeStreamRequest, SubscribeStreamResponse,
};
use crate::error::{PluginError, Result};
use crate::instrumentation::PluginMetrics;
use crate::protocol::{CapabilitySet, ClientV2, ProtocolClient};

pub struct CorePlugin {
    id: String,
    client: ClientV2,
    decommissioned: AtomicBool,
}

impl CorePlugin {
    pub fn new(
        id: impl Into<String>,
        capabilities: CapabilitySet,
        metrics: Arc<PluginMetrics>,
    ) -> Result<Self> {
        let id = id.into();
        if capabilities.is_empty() {
            return Err(PluginError::NoCompatibleImplementation(id));
        }
        Ok(Self {
            client: ClientV2::new(&id, capabilities, metrics),
            id,
            decommissioned: AtomicBool::new(false),
        })
    }

    pub async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.client.transform_data(req).await
    }

    pub async fn render(&self, req: RenderRequest) -> Result<RenderResponse> {
        self.client.render(req).await
    }
}

#[async_trait]
impl BackendPlugin for CorePlugin {
    fn plugin_id(&self) -> &str {
        &self.id
    }

    fn is_managed(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<()> {
        if self.decommissioned.load(Ordering::SeqCst) {
            return Err(PluginError::Unavailable(self.id.clone()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn exited(&self) -> bool {
        false
    }

    async fn decommission(&self) {
        self.decommissioned.store(true, Ordering::SeqCst);
    }

    async fn is_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginClient for CorePlugin {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.client.query_data(req).await
    }

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        self.client.call_resource(req, sender).await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        self.client.check_health(req).await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        self.client.collect_metrics(req).await
    }

    async fn subscribe_stream(
        &self,
        req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        self.client.subscribe_stream(req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        self.client.publish_stream(req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        self.client.run_stream(req, sender).await
    }
}
