//! Per-call plugin metrics
//!
//! Every capability call is counted and timed, tagged by plugin id and
//! endpoint. A drained stream counts as success; an error never changes the
//! value returned to the caller.

use async_trait::async_trait;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{QueryDataHandler, QueryDataRequest, QueryDataResponse, TransformDataHandler};
use crate::error::{PluginError, Result};

/// Logical endpoint a measured call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    QueryData,
    TransformData,
    CallResource,
    CheckHealth,
    CollectMetrics,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryData => "queryData",
            Self::TransformData => "transformData",
            Self::CallResource => "callResource",
            Self::CheckHealth => "checkHealth",
            Self::CollectMetrics => "collectMetrics",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct PluginMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
}

impl PluginMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "plugin_request_total",
                "Total number of backend plugin requests",
            ),
            &["plugin_id", "endpoint", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "plugin_request_duration_seconds",
                "Backend plugin request duration in seconds",
            ),
            &["plugin_id", "endpoint"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
        })
    }

    pub fn record(&self, plugin_id: &str, endpoint: Endpoint, status: &str, elapsed_secs: f64) {
        self.requests
            .with_label_values(&[plugin_id, endpoint.as_str(), status])
            .inc();
        self.duration
            .with_label_values(&[plugin_id, endpoint.as_str()])
            .observe(elapsed_secs);
    }

    pub fn request_count(&self, plugin_id: &str, endpoint: Endpoint, status: &str) -> u64 {
        self.requests
            .with_label_values(&[plugin_id, endpoint.as_str(), status])
            .get()
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every recorded series
    pub fn encode_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| PluginError::Transport(e.to_string()))
    }
}

fn status_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) | Err(PluginError::StreamDrained) => "ok",
        Err(PluginError::Cancelled) => "cancelled",
        Err(_) => "error",
    }
}

/// Awaits `call`, recording its outcome and latency.
pub async fn instrument<T, F>(
    metrics: &PluginMetrics,
    plugin_id: &str,
    endpoint: Endpoint,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = call.await;
    let elapsed = started.elapsed().as_secs_f64();
    let status = status_label(&result);

    metrics.record(plugin_id, endpoint, status, elapsed);
    tracing::trace!(
        plugin_id = %plugin_id,
        endpoint = %endpoint,
        status,
        elapsed_secs = elapsed,
        "Plugin request finished"
    );

    result
}

/// Measures a query handler
pub struct InstrumentedQueryData {
    inner: Arc<dyn QueryDataHandler>,
    plugin_id: String,
    metrics: Arc<PluginMetrics>,
}

impl InstrumentedQueryData {
    pub fn new(
        inner: Arc<dyn QueryDataHandler>,
        plugin_id: impl Into<String>,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            inner,
            plugin_id: plugin_id.into(),
            metrics,
        }
    }
}

#[async_trait]
impl QueryDataHandler for InstrumentedQueryData {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        instrument(
            &self.metrics,
            &self.plugin_id,
            Endpoint::QueryData,
            self.inner.query_data(req),
        )
        .await
    }
}

/// Measures a transform handler
pub struct InstrumentedTransformData {
    inner: Arc<dyn TransformDataHandler>,
    plugin_id: String,
    metrics: Arc<PluginMetrics>,
}

impl InstrumentedTransformData {
    pub fn new(
        inner: Arc<dyn TransformDataHandler>,
        plugin_id: impl Into<String>,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            inner,
            plugin_id: plugin_id.into(),
            metrics,
        }
    }
}

#[async_trait]
impl TransformDataHandler for InstrumentedTransformData {
    async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        instrument(
            &self.metrics,
            &self.plugin_id,
            Endpoint::TransformData,
            self.inner.transform_data(req),
        )
        .await
    }
}
