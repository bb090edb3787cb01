//! In-memory plugin stand-ins for unit tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    CallResourceRequest, CallResourceResponse, CallResourceResponseSender, CheckHealthRequest,
    CheckHealthResult, CollectMetricsRequest, CollectMetricsResult, DataResponse,
    DiagnosticsHandler, HealthStatus, LegacyDatasource, LegacyQueryRequest, LegacyQueryResponse,
    LegacyQueryResult, PluginClient, PublishStreamRequest, PublishStreamResponse,
    QueryDataHandler, QueryDataRequest, QueryDataResponse, RenderHandler, RenderRequest,
    RenderResponse, ResourceHandler, RunStreamRequest, StreamHandler, StreamPacket,
    StreamPacketSender, SubscribeStreamRequest, SubscribeStreamResponse, TransformDataHandler,
};
use crate::error::{PluginError, Result};
use crate::instrumentation::PluginMetrics;
use crate::plugin::{Connection, ConnectionFactory, PluginDescriptor, ProcessHandle};
use crate::protocol::{Capability, CapabilityObject, LegacyPlugin};
use crate::stream::{ChunkedResponseStream, ResourceStream};

/// Query handler answering every call with the same response
#[derive(Default)]
pub struct FakeData {
    pub calls: AtomicUsize,
}

impl FakeData {
    pub fn response(&self) -> QueryDataResponse {
        let mut responses = HashMap::new();
        responses.insert(
            "A".to_string(),
            DataResponse {
                frames: vec![json!({"name": "fake"})],
                error: None,
            },
        );
        QueryDataResponse { responses }
    }
}

#[async_trait]
impl QueryDataHandler for FakeData {
    async fn query_data(&self, _req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response())
    }
}

#[async_trait]
impl TransformDataHandler for FakeData {
    async fn transform_data(&self, _req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response())
    }
}

#[derive(Default)]
pub struct FakeDiagnostics;

#[async_trait]
impl DiagnosticsHandler for FakeDiagnostics {
    async fn check_health(&self, _req: CheckHealthRequest) -> Result<CheckHealthResult> {
        Ok(CheckHealthResult {
            status: HealthStatus::Ok,
            message: "ok".into(),
            json_details: json!({}),
        })
    }

    async fn collect_metrics(&self, _req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        Ok(CollectMetricsResult {
            prometheus_metrics: b"up 1\n".to_vec(),
        })
    }
}

/// Resource handler streaming fixed chunks and remembering the last request
#[derive(Default)]
pub struct FakeResource {
    chunks: Vec<String>,
    last: Mutex<Option<CallResourceRequest>>,
}

impl FakeResource {
    pub fn with_chunks(chunks: Vec<&str>) -> Self {
        Self {
            chunks: chunks.into_iter().map(String::from).collect(),
            last: Mutex::new(None),
        }
    }

    pub fn last_request(&self) -> Option<CallResourceRequest> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceHandler for FakeResource {
    async fn call_resource(&self, req: CallResourceRequest) -> Result<Box<dyn ResourceStream>> {
        *self.last.lock().unwrap() = Some(req);
        let chunks: Vec<Result<CallResourceResponse>> = self
            .chunks
            .iter()
            .map(|body| {
                Ok(CallResourceResponse {
                    status: 200,
                    body: body.as_bytes().to_vec(),
                    ..Default::default()
                })
            })
            .collect();
        Ok(Box::new(ChunkedResponseStream::new(
            stream::iter(chunks).boxed(),
        )))
    }
}

#[derive(Default)]
pub struct FakeRenderer;

#[async_trait]
impl RenderHandler for FakeRenderer {
    async fn render(&self, _req: RenderRequest) -> Result<RenderResponse> {
        Ok(RenderResponse {
            body: b"png".to_vec(),
            error: None,
        })
    }
}

/// Stream handler emitting `packets` numbered packets per run
#[derive(Default)]
pub struct FakeStream {
    pub packets: usize,
}

#[async_trait]
impl StreamHandler for FakeStream {
    async fn subscribe_stream(
        &self,
        _req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        Ok(SubscribeStreamResponse::default())
    }

    async fn publish_stream(&self, _req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        Ok(PublishStreamResponse::default())
    }

    async fn run_stream(
        &self,
        _req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        for n in 0..self.packets {
            sender.send(StreamPacket { data: json!(n) }).await?;
        }
        Ok(())
    }
}

/// Legacy datasource echoing one series per query
#[derive(Default)]
pub struct FakeLegacy {
    last: Mutex<Option<LegacyQueryRequest>>,
}

impl FakeLegacy {
    pub fn last_request(&self) -> Option<LegacyQueryRequest> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl LegacyDatasource for FakeLegacy {
    async fn query(&self, req: LegacyQueryRequest) -> Result<LegacyQueryResponse> {
        let results = req
            .queries
            .iter()
            .map(|q| {
                (
                    q.ref_id.clone(),
                    LegacyQueryResult {
                        series: vec![json!({"refId": q.ref_id})],
                        error: None,
                    },
                )
            })
            .collect();
        *self.last.lock().unwrap() = Some(req);
        Ok(LegacyQueryResponse { results })
    }
}

/// Shared script driving every [`ScriptedConnection`] a factory produces.
///
/// Counts starts and kills across connections, and can crash whichever
/// connection is current.
pub struct ConnectionScript {
    starts: AtomicUsize,
    kills: AtomicUsize,
    version: AtomicU32,
    fail_start: AtomicBool,
    start_delay: Mutex<Duration>,
    objects: Vec<CapabilityObject>,
    legacy: Option<LegacyPlugin>,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl ConnectionScript {
    fn new(
        version: u32,
        objects: Vec<CapabilityObject>,
        legacy: Option<LegacyPlugin>,
    ) -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            version: AtomicU32::new(version),
            fail_start: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            objects,
            legacy,
            current: Mutex::new(None),
        })
    }

    /// Generation-2 plugin dispensing `objects`
    pub fn v2(objects: Vec<CapabilityObject>) -> Arc<Self> {
        Self::new(2, objects, None)
    }

    /// Generation-2 plugin serving data and diagnostics
    pub fn healthy() -> Arc<Self> {
        Self::v2(vec![
            CapabilityObject::Data(Arc::new(FakeData::default())),
            CapabilityObject::Diagnostics(Arc::new(FakeDiagnostics)),
        ])
    }

    pub fn v1(legacy: LegacyPlugin) -> Arc<Self> {
        Self::new(1, Vec::new(), Some(legacy))
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent handshake take `delay`.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Simulates the current plugin process dying.
    pub fn crash(&self) {
        if let Some(alive) = self.current.lock().unwrap().as_ref() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn factory(self: &Arc<Self>) -> ConnectionFactory {
        let script = self.clone();
        Arc::new(move || {
            Box::new(ScriptedConnection {
                script: script.clone(),
                alive: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
            }) as Box<dyn Connection>
        })
    }

    /// A process handle for `descriptor` backed by this script
    pub fn handle(self: &Arc<Self>, descriptor: PluginDescriptor) -> ProcessHandle {
        ProcessHandle::new(
            descriptor,
            self.factory(),
            Arc::new(PluginMetrics::new().unwrap()),
        )
    }
}

pub struct ScriptedConnection {
    script: Arc<ConnectionScript>,
    alive: Arc<AtomicBool>,
    started: AtomicBool,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn start(&self) -> Result<u32> {
        self.script.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.script.fail_start.load(Ordering::SeqCst) {
            return Err(PluginError::HandshakeFailed("scripted failure".into()));
        }
        self.started.store(true, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
        *self.script.current.lock().unwrap() = Some(self.alive.clone());
        Ok(self.script.version.load(Ordering::SeqCst))
    }

    async fn dispense(&self, capability: Capability) -> Result<Option<CapabilityObject>> {
        Ok(self
            .script
            .objects
            .iter()
            .find(|object| object.capability() == capability)
            .cloned())
    }

    async fn dispense_legacy(&self, _plugin_id: &str) -> Result<Option<LegacyPlugin>> {
        Ok(self.script.legacy.clone())
    }

    fn exited(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.started.load(Ordering::SeqCst).then_some(4242)
    }

    async fn kill(&self) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            self.script.kills.fetch_add(1, Ordering::SeqCst);
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Terminal client that remembers what reached it
#[derive(Default)]
pub struct RecordingClient {
    pub queries: Mutex<Vec<QueryDataRequest>>,
    pub resources: Mutex<Vec<CallResourceRequest>>,
    pub health_checks: Mutex<Vec<CheckHealthRequest>>,
}

impl RecordingClient {
    pub fn last_query(&self) -> Option<QueryDataRequest> {
        self.queries.lock().unwrap().last().cloned()
    }

    pub fn last_resource(&self) -> Option<CallResourceRequest> {
        self.resources.lock().unwrap().last().cloned()
    }

    pub fn last_health_check(&self) -> Option<CheckHealthRequest> {
        self.health_checks.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PluginClient for RecordingClient {
    async fn query_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse> {
        self.queries.lock().unwrap().push(req);
        Ok(QueryDataResponse::default())
    }

    async fn call_resource(
        &self,
        req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        self.resources.lock().unwrap().push(req);
        sender
            .send(CallResourceResponse {
                status: 200,
                ..Default::default()
            })
            .await
    }

    async fn check_health(&self, req: CheckHealthRequest) -> Result<CheckHealthResult> {
        self.health_checks.lock().unwrap().push(req);
        Ok(CheckHealthResult {
            status: HealthStatus::Ok,
            ..Default::default()
        })
    }

    async fn collect_metrics(&self, _req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        Ok(CollectMetricsResult::default())
    }

    async fn subscribe_stream(
        &self,
        _req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        Ok(SubscribeStreamResponse::default())
    }

    async fn publish_stream(&self, _req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        Ok(PublishStreamResponse::default())
    }

    async fn run_stream(
        &self,
        _req: RunStreamRequest,
        _sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        Ok(())
    }
}
