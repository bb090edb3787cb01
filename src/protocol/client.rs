use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::version::ProtocolVersion;
use crate::backend::{
    CallResourceRequest, DiagnosticsHandler, LegacyDatasource, PluginClient, QueryDataHandler,
    QueryDataRequest, QueryDataResponse, RenderHandler, RenderRequest, RenderResponse,
    ResourceHandler, StreamHandler, TransformDataHandler,
};
use crate::error::Result;
use crate::stream::ResourceStream;

/// A capability a generation-2 plugin may dispense
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Diagnostics,
    Resource,
    Data,
    Transform,
    Renderer,
    Stream,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Self::Diagnostics,
        Self::Resource,
        Self::Data,
        Self::Transform,
        Self::Renderer,
        Self::Stream,
    ];

    /// Name used on the wire and in handshakes
    pub fn name(&self) -> &'static str {
        match self {
            Self::Diagnostics => "diagnostics",
            Self::Resource => "resource",
            Self::Data => "data",
            Self::Transform => "transform",
            Self::Renderer => "renderer",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dispensed capability object
#[derive(Clone)]
pub enum CapabilityObject {
    Diagnostics(Arc<dyn DiagnosticsHandler>),
    Resource(Arc<dyn ResourceHandler>),
    Data(Arc<dyn QueryDataHandler>),
    Transform(Arc<dyn TransformDataHandler>),
    Renderer(Arc<dyn RenderHandler>),
    Stream(Arc<dyn StreamHandler>),
}

impl CapabilityObject {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Diagnostics(_) => Capability::Diagnostics,
            Self::Resource(_) => Capability::Resource,
            Self::Data(_) => Capability::Data,
            Self::Transform(_) => Capability::Transform,
            Self::Renderer(_) => Capability::Renderer,
            Self::Stream(_) => Capability::Stream,
        }
    }
}

/// Whatever subset of capabilities a generation-2 plugin dispensed
#[derive(Clone, Default)]
pub struct CapabilitySet {
    pub diagnostics: Option<Arc<dyn DiagnosticsHandler>>,
    pub resource: Option<Arc<dyn ResourceHandler>>,
    pub data: Option<Arc<dyn QueryDataHandler>>,
    pub transform: Option<Arc<dyn TransformDataHandler>>,
    pub renderer: Option<Arc<dyn RenderHandler>>,
    pub stream: Option<Arc<dyn StreamHandler>>,
}

impl CapabilitySet {
    pub fn insert(&mut self, object: CapabilityObject) {
        match object {
            CapabilityObject::Diagnostics(h) => self.diagnostics = Some(h),
            CapabilityObject::Resource(h) => self.resource = Some(h),
            CapabilityObject::Data(h) => self.data = Some(h),
            CapabilityObject::Transform(h) => self.transform = Some(h),
            CapabilityObject::Renderer(h) => self.renderer = Some(h),
            CapabilityObject::Stream(h) => self.stream = Some(h),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let present = [
            (Capability::Diagnostics, self.diagnostics.is_some()),
            (Capability::Resource, self.resource.is_some()),
            (Capability::Data, self.data.is_some()),
            (Capability::Transform, self.transform.is_some()),
            (Capability::Renderer, self.renderer.is_some()),
            (Capability::Stream, self.stream.is_some()),
        ];
        present
            .into_iter()
            .filter(|(_, has)| *has)
            .map(|(cap, _)| cap.name())
            .collect()
    }
}

/// The single object a generation-1 plugin dispenses, plus its optional
/// renderer
#[derive(Clone)]
pub struct LegacyPlugin {
    pub datasource: Arc<dyn LegacyDatasource>,
    pub renderer: Option<Arc<dyn RenderHandler>>,
}

/// A protocol-generation-specific client for one running plugin.
///
/// Methods the plugin cannot serve fail with `MethodNotImplemented`,
/// whichever generation it speaks.
#[async_trait]
pub trait ProtocolClient: PluginClient {
    fn protocol_version(&self) -> ProtocolVersion;

    async fn transform_data(&self, req: QueryDataRequest) -> Result<QueryDataResponse>;

    async fn render(&self, req: RenderRequest) -> Result<RenderResponse>;

    /// Opens the raw response stream for a resource call.
    ///
    /// Plugins without a resource capability answer with a single
    /// 501 response.
    async fn resource_stream(&self, req: CallResourceRequest) -> Result<Box<dyn ResourceStream>>;
}
