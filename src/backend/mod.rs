//! Request and response values exchanged with backend plugins
//!
//! These types are the host's view of every capability a plugin can serve.
//! They are transport-agnostic: the protocol layer serialises them into RPC
//! frames, in-process core plugins receive them directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod handlers;

pub use handlers::{
    CallResourceResponseSender, DiagnosticsHandler, LegacyDatasource, PluginClient,
    QueryDataHandler, RenderHandler, ResourceHandler, StreamHandler, StreamPacketSender,
    TransformDataHandler,
};

/// Multi-valued HTTP-style headers, keyed by canonical header name
pub type Headers = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// Settings of the datasource instance a request targets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInstanceSettings {
    pub id: i64,
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub json_data: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub decrypted_secure_json_data: HashMap<String, String>,
}

impl DataSourceInstanceSettings {
    /// Whether the caller's OAuth token should be forwarded to the plugin.
    pub fn oauth_pass_through(&self) -> bool {
        self.json_data
            .get("oauthPassThru")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Cookie names the caller is allowed to forward.
    pub fn keep_cookies(&self) -> Vec<String> {
        self.json_data
            .get("keepCookies")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Identifies the plugin and caller a request is made on behalf of
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    pub org_id: i64,
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_instance_settings: Option<DataSourceInstanceSettings>,
}

impl PluginContext {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Default::default()
        }
    }

    pub fn with_datasource(mut self, settings: DataSourceInstanceSettings) -> Self {
        self.data_source_instance_settings = Some(settings);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    pub ref_id: String,
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub max_data_points: i64,
    #[serde(default)]
    pub interval_ms: i64,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub json: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDataRequest {
    pub plugin_context: PluginContext,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    #[serde(default)]
    pub frames: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDataResponse {
    /// Responses keyed by the `ref_id` of the query that produced them
    #[serde(default)]
    pub responses: HashMap<String, DataResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResourceRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResourceResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl CallResourceResponse {
    /// The synthetic response used when a plugin has no resource capability.
    pub fn not_implemented() -> Self {
        Self {
            status: 501,
            headers: Headers::new(),
            body: b"Not Implemented".to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHealthRequest {
    pub plugin_context: PluginContext,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHealthResult {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub json_details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectMetricsRequest {
    pub plugin_context: PluginContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectMetricsResult {
    /// Prometheus text exposition of the plugin's own metrics
    #[serde(default)]
    pub prometheus_metrics: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeStreamRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Ok,
    NotFound,
    PermissionDenied,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeStreamResponse {
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStreamRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStreamResponse {
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStreamRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPacket {
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub url: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale_factor")]
    pub device_scale_factor: f64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_scale_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResponse {
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Query shape understood by generation-1 plugins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyQuery {
    pub ref_id: String,
    pub model: Value,
    pub max_data_points: i64,
    pub interval_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyQueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DataSourceInstanceSettings>,
    pub time_range: TimeRange,
    pub queries: Vec<LegacyQuery>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyQueryResult {
    #[serde(default)]
    pub series: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyQueryResponse {
    #[serde(default)]
    pub results: HashMap<String, LegacyQueryResult>,
}
