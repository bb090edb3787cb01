//! Capability objects backed by a plugin process
//!
//! Each dispensed capability is a thin stub that forwards calls over the
//! shared [`RpcChannel`] with its capability name attached.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::sync::Arc;

use super::rpc::RpcChannel;
use crate::backend::{
    CallResourceRequest, CallResourceResponse, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, DiagnosticsHandler, LegacyDatasource,
    LegacyQueryRequest, LegacyQueryResponse, PublishStreamRequest, PublishStreamResponse,
    QueryDataHandler, QueryDataRequest, QueryDataResponse, RenderHandler, RenderRequest,
    RenderResponse, ResourceHandler, RunStreamRequest, StreamHandler, StreamPacket,
    StreamPacketSender, SubscribeStreamRequest, SubscribeStreamResponse, TransformDataHandler,
};
use crate::error::{PluginError, Result};
use crate::stream::{ChunkedResponseStream, ResourceStream};

#[derive(Clone)]
pub struct RemoteCapability {
    channel: Arc<RpcChannel>,
    capability: &'static str,
}

impl RemoteCapability {
    pub fn new(channel: Arc<RpcChannel>, capability: &'static str) -> Self {
        Self {
            channel,
            capability,
        }
    }
}

#[async_trait]
impl QueryDataHandler for RemoteCapability {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.channel.call(self.capability, "query_data", &req).await
    }
}

#[async_trait]
impl TransformDataHandler for RemoteCapability {
    async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.channel.call(self.capability, "transform_data", &req).await
    }
}

#[async_trait]
impl DiagnosticsHandler for RemoteCapability {
    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        self.channel.call(self.capability, "check_health", &req).await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        self.channel
            .call(self.capability, "collect_metrics", &req)
            .await
    }
}

#[async_trait]
impl ResourceHandler for RemoteCapability {
    async fn call_resource(&self, req: CallResourceRequest) -> Result<Box<dyn ResourceStream>> {
        let (id, rx) = self
            .channel
            .call_streaming(self.capability, "call_resource", &req)
            .await?;

        let chunks = stream::unfold(rx, |mut rx| async move {
            let next = rx.recv().await?;
            let chunk = next.map_err(PluginError::normalize).and_then(|payload| {
                serde_json::from_value::<CallResourceResponse>(payload).map_err(Into::into)
            });
            Some((chunk, rx))
        })
        .boxed();

        let channel = self.channel.clone();
        let stream = ChunkedResponseStream::new(chunks)
            .with_close(Box::new(move || async move { channel.cancel(id).await }.boxed()));

        Ok(Box::new(stream))
    }
}

#[async_trait]
impl StreamHandler for RemoteCapability {
    async fn subscribe_stream(
        &self,
        req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        self.channel
            .call(self.capability, "subscribe_stream", &req)
            .await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        self.channel
            .call(self.capability, "publish_stream", &req)
            .await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        let (id, mut rx) = self
            .channel
            .call_streaming(self.capability, "run_stream", &req)
            .await?;

        while let Some(next) = rx.recv().await {
            let packet: StreamPacket = match next {
                Ok(payload) => serde_json::from_value(payload)?,
                Err(e) => return Err(e.normalize()),
            };
            if let Err(e) = sender.send(packet).await {
                self.channel.cancel(id).await?;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RenderHandler for RemoteCapability {
    async fn render(&self, req: RenderRequest) -> Result<RenderResponse> {
        self.channel.call(self.capability, "render", &req).await
    }
}

#[async_trait]
impl LegacyDatasource for RemoteCapability {
    async fn query(&self, req: LegacyQueryRequest) -> Result<LegacyQueryResponse> {
        self.channel.call(self.capability, "query", &req).await
    }
}
