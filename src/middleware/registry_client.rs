//! Terminal client routing each request to the plugin it names

use async_trait::async_trait;
use std::sync::Arc;

use super::{require_path, require_plugin};
use crate::backend::{
    CallResourceRequest, CallResourceResponseSender, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, PluginClient, PluginContext,
    PublishStreamRequest, PublishStreamResponse, QueryDataRequest, QueryDataResponse,
    RunStreamRequest, StreamPacketSender, SubscribeStreamRequest, SubscribeStreamResponse,
};
use crate::error::Result;
use crate::lifecycle::Registry;
use crate::plugin::BackendPlugin;

pub struct RegistryClient {
    registry: Arc<Registry>,
}

impl RegistryClient {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    async fn plugin(&self, context: &PluginContext) -> Result<Arc<dyn BackendPlugin>> {
        require_plugin(context)?;
        self.registry.get(&context.plugin_id).await
    }
}

#[async_trait]
impl PluginClient for RegistryClient {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.query_data(req).await
    }

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.call_resource(req, sender).await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.check_health(req).await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.collect_metrics(req).await
    }

    async fn subscribe_stream(
        &self,
        req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        require_path(&req.plugin_context, &req.path)?;
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.subscribe_stream(req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        require_path(&req.plugin_context, &req.path)?;
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.publish_stream(req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        require_path(&req.plugin_context, &req.path)?;
        let plugin = self.plugin(&req.plugin_context).await?;
        plugin.run_stream(req, sender).await
    }
}
