//! Generation-2 client
//!
//! Each method delegates to its capability when the plugin dispensed one and
//! answers `MethodNotImplemented` otherwise.

use async_trait::async_trait;
use std::sync::Arc;

use super::client::{CapabilitySet, ProtocolClient};
use super::version::ProtocolVersion;
use crate::backend::{
    CallResourceRequest, CallResourceResponseSender, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, PluginClient, PublishStreamRequest,
    PublishStreamResponse, QueryDataRequest, QueryDataResponse, RenderRequest, RenderResponse,
    RunStreamRequest, StreamHandler, StreamPacketSender, SubscribeStreamRequest,
    SubscribeStreamResponse,
};
use crate::error::{PluginError, Result};
use crate::instrumentation::{
    instrument, Endpoint, InstrumentedQueryData, InstrumentedTransformData, PluginMetrics,
};
use crate::stream::{relay, ResourceStream, SingleResponseStream};

pub struct ClientV2 {
    plugin_id: String,
    capabilities: CapabilitySet,
    metrics: Arc<PluginMetrics>,
}

impl ClientV2 {
    pub fn new(
        plugin_id: &str,
        mut capabilities: CapabilitySet,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        if let Some(data) = capabilities.data.take() {
            capabilities.data = Some(Arc::new(InstrumentedQueryData::new(
                data,
                plugin_id,
                metrics.clone(),
            )));
        }
        if let Some(transform) = capabilities.transform.take() {
            capabilities.transform = Some(Arc::new(InstrumentedTransformData::new(
                transform,
                plugin_id,
                metrics.clone(),
            )));
        }

        Self {
            plugin_id: plugin_id.to_string(),
            capabilities,
            metrics,
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn stream_handler(&self) -> Result<&Arc<dyn StreamHandler>> {
        self.capabilities
            .stream
            .as_ref()
            .ok_or(PluginError::MethodNotImplemented)
    }
}

#[async_trait]
impl PluginClient for ClientV2 {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        match &self.capabilities.data {
            Some(data) => data.query_data(req).await,
            None => Err(PluginError::MethodNotImplemented),
        }
    }

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        let Some(resource) = &self.capabilities.resource else {
            return Err(PluginError::MethodNotImplemented);
        };

        instrument(&self.metrics, &self.plugin_id, Endpoint::CallResource, async {
            let mut stream = resource.call_resource(req).await?;
            relay(stream.as_mut(), sender).await
        })
        .await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        let Some(diagnostics) = &self.capabilities.diagnostics else {
            return Err(PluginError::MethodNotImplemented);
        };
        instrument(
            &self.metrics,
            &self.plugin_id,
            Endpoint::CheckHealth,
            diagnostics.check_health(req),
        )
        .await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        let Some(diagnostics) = &self.capabilities.diagnostics else {
            return Err(PluginError::MethodNotImplemented);
        };
        instrument(
            &self.metrics,
            &self.plugin_id,
            Endpoint::CollectMetrics,
            diagnostics.collect_metrics(req),
        )
        .await
    }

    async fn subscribe_stream(
        &self,
        req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        self.stream_handler()?.subscribe_stream(req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        self.stream_handler()?.publish_stream(req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        self.stream_handler()?.run_stream(req, sender).await
    }
}

#[async_trait]
impl ProtocolClient for ClientV2 {
    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::V2
    }

    async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        match &self.capabilities.transform {
            Some(transform) => transform.transform_data(req).await,
            None => Err(PluginError::MethodNotImplemented),
        }
    }

    async fn render(&self, req: RenderRequest) -> Result<RenderResponse> {
        match &self.capabilities.renderer {
            Some(renderer) => renderer.render(req).await,
            None => Err(PluginError::MethodNotImplemented),
        }
    }

    async fn resource_stream(&self, req: CallResourceRequest) -> Result<Box<dyn ResourceStream>> {
        match &self.capabilities.resource {
            Some(resource) => resource.call_resource(req).await,
            None => Ok(Box::new(SingleResponseStream::not_implemented())),
        }
    }
}
