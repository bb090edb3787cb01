//! Generation-1 client
//!
//! A legacy plugin serves a single query object and, optionally, a renderer.
//! Everything else answers `MethodNotImplemented`.

use async_trait::async_trait;
use std::sync::Arc;

use super::client::{LegacyPlugin, ProtocolClient};
use super::version::ProtocolVersion;
use crate::backend::{
    CallResourceRequest, CallResourceResponseSender, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, DataResponse, LegacyDatasource, LegacyQuery,
    LegacyQueryRequest, PluginClient, PublishStreamRequest, PublishStreamResponse,
    QueryDataHandler, QueryDataRequest, QueryDataResponse, RenderHandler, RenderRequest,
    RenderResponse, RunStreamRequest, StreamPacketSender, SubscribeStreamRequest,
    SubscribeStreamResponse,
};
use crate::error::{PluginError, Result};
use crate::instrumentation::{InstrumentedQueryData, PluginMetrics};
use crate::stream::{ResourceStream, SingleResponseStream};

/// Presents a legacy query object as a data handler
pub struct LegacyQueryAdapter {
    datasource: Arc<dyn LegacyDatasource>,
}

impl LegacyQueryAdapter {
    pub fn new(datasource: Arc<dyn LegacyDatasource>) -> Self {
        Self { datasource }
    }

    fn to_legacy(req: QueryDataRequest) -> LegacyQueryRequest {
        let time_range = req
            .queries
            .first()
            .map(|q| q.time_range)
            .unwrap_or_default();

        LegacyQueryRequest {
            datasource: req.plugin_context.data_source_instance_settings,
            time_range,
            queries: req
                .queries
                .into_iter()
                .map(|q| LegacyQuery {
                    ref_id: q.ref_id,
                    model: q.json,
                    max_data_points: q.max_data_points,
                    interval_ms: q.interval_ms,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl QueryDataHandler for LegacyQueryAdapter {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        let legacy = self.datasource.query(Self::to_legacy(req)).await?;

        let responses = legacy
            .results
            .into_iter()
            .map(|(ref_id, result)| {
                (
                    ref_id,
                    DataResponse {
                        frames: result.series,
                        error: result.error,
                    },
                )
            })
            .collect();

        Ok(QueryDataResponse { responses })
    }
}

pub struct ClientV1 {
    data: Arc<dyn QueryDataHandler>,
    renderer: Option<Arc<dyn RenderHandler>>,
}

impl ClientV1 {
    pub fn new(plugin_id: &str, legacy: LegacyPlugin, metrics: Arc<PluginMetrics>) -> Self {
        let adapter = Arc::new(LegacyQueryAdapter::new(legacy.datasource));
        Self {
            data: Arc::new(InstrumentedQueryData::new(adapter, plugin_id, metrics)),
            renderer: legacy.renderer,
        }
    }
}

#[async_trait]
impl PluginClient for ClientV1 {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.data.query_data(req).await
    }

    async fn call_resource(
        &self,
        _req: CallResourceRequest,
        _sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        Err(PluginError::MethodNotImplemented)
    }

    async fn check_health(&self, _req: CheckHealthRequest) -> Result<CheckHealthResult> {
        Err(PluginError::MethodNotImplemented)
    }

    async fn collect_metrics(&self, _req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        Err(PluginError::MethodNotImplemented)
    }

    async fn subscribe_stream(
        &self,
        _req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        Err(PluginError::MethodNotImplemented)
    }

    async fn publish_stream(&self, _req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        Err(PluginError::MethodNotImplemented)
    }

    async fn run_stream(
        &self,
        _req: RunStreamRequest,
        _sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        Err(PluginError::MethodNotImplemented)
    }
}

#[async_trait]
impl ProtocolClient for ClientV1 {
    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::V1
    }

    async fn transform_data(&self, _req: QueryDataRequest) -> Result<QueryDataResponse> {
        Err(PluginError::MethodNotImplemented)
    }

    async fn render(&self, req: RenderRequest) -> Result<RenderResponse> {
        match &self.renderer {
            Some(renderer) => renderer.render(req).await,
            None => Err(PluginError::MethodNotImplemented),
        }
    }

    async fn resource_stream(&self, _req: CallResourceRequest) -> Result<Box<dyn ResourceStream>> {
        Ok(Box::new(SingleResponseStream::not_implemented()))
    }
}
