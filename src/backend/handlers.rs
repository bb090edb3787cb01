//! Capability handler traits
//!
//! A plugin exposes each capability as an independent handler. The host
//! combines whichever handlers a plugin provides behind [`PluginClient`],
//! the single surface consumers outside the runtime call.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    CallResourceRequest, CallResourceResponse, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, LegacyQueryRequest, LegacyQueryResponse,
    PublishStreamRequest, PublishStreamResponse, QueryDataRequest, QueryDataResponse,
    RenderRequest, RenderResponse, RunStreamRequest, StreamPacket, SubscribeStreamRequest,
    SubscribeStreamResponse,
};
use crate::error::{PluginError, Result};
use crate::stream::ResourceStream;

#[async_trait]
pub trait QueryDataHandler: Send + Sync {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse>;
}

#[async_trait]
pub trait TransformDataHandler: Send + Sync {
    async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse>;
}

/// Resource calls answer with a stream of one or more response chunks
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn call_resource(&self, req: CallResourceRequest) -> Result<Box<dyn ResourceStream>>;
}

/// Health checks and metrics collection
#[async_trait]
pub trait DiagnosticsHandler: Send + Sync {
    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult>;
    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult>;
}

#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn subscribe_stream(&self, req: SubscribeStreamRequest)
        -> Result<SubscribeStreamResponse>;
    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse>;
    async fn run_stream(&self, req: RunStreamRequest, sender: &dyn StreamPacketSender)
        -> Result<()>;
}

#[async_trait]
pub trait RenderHandler: Send + Sync {
    async fn render(&self, req: RenderRequest) -> Result<RenderResponse>;
}

/// The single query object a generation-1 plugin exposes
#[async_trait]
pub trait LegacyDatasource: Send + Sync {
    async fn query(&self, req: LegacyQueryRequest) -> Result<LegacyQueryResponse>;
}

#[async_trait]
pub trait CallResourceResponseSender: Send + Sync {
    async fn send(&self, resp: CallResourceResponse) -> Result<()>;
}

#[async_trait]
pub trait StreamPacketSender: Send + Sync {
    async fn send(&self, packet: StreamPacket) -> Result<()>;
}

#[async_trait]
impl CallResourceResponseSender for mpsc::UnboundedSender<CallResourceResponse> {
    async fn send(&self, resp: CallResourceResponse) -> Result<()> {
        mpsc::UnboundedSender::send(self, resp)
            .map_err(|_| PluginError::Transport("response receiver dropped".into()))
    }
}

#[async_trait]
impl StreamPacketSender for mpsc::UnboundedSender<StreamPacket> {
    async fn send(&self, packet: StreamPacket) -> Result<()> {
        mpsc::UnboundedSender::send(self, packet)
            .map_err(|_| PluginError::Transport("stream receiver dropped".into()))
    }
}

/// The uniform capability interface every plugin is reached through.
///
/// Plugin handles, protocol clients, middleware and the registry-routing
/// client all implement it, so interceptors compose around any of them.
#[async_trait]
pub trait PluginClient: Send + Sync {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse>;

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()>;

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult>;

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult>;

    async fn subscribe_stream(&self, req: SubscribeStreamRequest)
        -> Result<SubscribeStreamResponse>;

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse>;

    async fn run_stream(&self, req: RunStreamRequest, sender: &dyn StreamPacketSender)
        -> Result<()>;
}
