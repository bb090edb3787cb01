//! Forwards the caller's credentials to datasource plugins
//!
//! Only requests carrying datasource settings are touched, and only while a
//! caller session is in scope. The OAuth token is forwarded when the
//! datasource enables pass-through; cookies are reduced to the names the
//! datasource allows.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::session::CallerSession;
use super::{require_path, require_plugin, Middleware};
use crate::backend::{
    CallResourceRequest, CallResourceResponseSender, CheckHealthRequest, CheckHealthResult,
    CollectMetricsRequest, CollectMetricsResult, DataSourceInstanceSettings, Headers,
    PluginClient, PluginContext, PublishStreamRequest, PublishStreamResponse, QueryDataRequest,
    QueryDataResponse, RunStreamRequest, StreamPacketSender, SubscribeStreamRequest,
    SubscribeStreamResponse,
};
use crate::error::Result;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const ID_TOKEN_HEADER: &str = "X-ID-Token";
pub const COOKIE_HEADER: &str = "Cookie";

pub fn forward_credentials() -> Middleware {
    Arc::new(|next: Arc<dyn PluginClient>| -> Arc<dyn PluginClient> {
        Arc::new(ForwardCredentials::new(next))
    })
}

pub struct ForwardCredentials {
    next: Arc<dyn PluginClient>,
}

/// Header values to apply to one outbound request
#[derive(Debug, Default, PartialEq)]
struct Credentials {
    authorization: Option<String>,
    id_token: Option<String>,
    /// `None` removes any cookie header the request already had
    cookie: Option<String>,
}

impl Credentials {
    fn resolve(settings: &DataSourceInstanceSettings, session: &CallerSession) -> Self {
        let mut credentials = Self::default();

        if settings.oauth_pass_through() {
            if let Some(token) = &session.oauth {
                credentials.authorization = Some(token.authorization());
                credentials.id_token = token.id_token.clone();
            }
        }

        let allowed = settings.keep_cookies();
        let cookies: Vec<String> = session
            .cookies
            .iter()
            .filter(|(name, _)| allowed.iter().any(|keep| keep == name))
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        if !cookies.is_empty() {
            credentials.cookie = Some(cookies.join("; "));
        }

        credentials
    }

    fn apply(self, headers: &mut HashMap<String, String>) {
        if let Some(authorization) = self.authorization {
            headers.insert(AUTHORIZATION_HEADER.to_string(), authorization);
        }
        if let Some(id_token) = self.id_token {
            headers.insert(ID_TOKEN_HEADER.to_string(), id_token);
        }
        match self.cookie {
            Some(cookie) => {
                headers.insert(COOKIE_HEADER.to_string(), cookie);
            }
            None => {
                headers.remove(COOKIE_HEADER);
            }
        }
    }

    fn apply_multi(self, headers: &mut Headers) {
        if let Some(authorization) = self.authorization {
            headers.insert(AUTHORIZATION_HEADER.to_string(), vec![authorization]);
        }
        if let Some(id_token) = self.id_token {
            headers.insert(ID_TOKEN_HEADER.to_string(), vec![id_token]);
        }
        match self.cookie {
            Some(cookie) => {
                headers.insert(COOKIE_HEADER.to_string(), vec![cookie]);
            }
            None => {
                headers.remove(COOKIE_HEADER);
            }
        }
    }
}

impl ForwardCredentials {
    pub fn new(next: Arc<dyn PluginClient>) -> Self {
        Self { next }
    }

    /// Credentials for `context`, or `None` when the request passes through.
    fn credentials(context: &mut PluginContext) -> Option<Credentials> {
        let settings = context.data_source_instance_settings.as_ref()?;
        let session = CallerSession::current()?;
        let credentials = Credentials::resolve(settings, &session);
        if context.user.is_none() {
            context.user = Some(session.user);
        }
        Some(credentials)
    }
}

#[async_trait]
impl PluginClient for ForwardCredentials {
    async fn query_data(&self, mut req: QueryDataRequest) -> Result<QueryDataResponse> {
        require_plugin(&req.plugin_context)?;
        if let Some(credentials) = Self::credentials(&mut req.plugin_context) {
            credentials.apply(&mut req.headers);
        }
        self.next.query_data(req).await
    }

    async fn call_resource(
        &self,
        mut req: CallResourceRequest,
        sender: &dyn CallResourceResponseSender,
    ) -> Result<()> {
        require_plugin(&req.plugin_context)?;
        if let Some(credentials) = Self::credentials(&mut req.plugin_context) {
            credentials.apply_multi(&mut req.headers);
        }
        self.next.call_resource(req, sender).await
    }

    async fn check_health(&self, mut req: CheckHealthRequest) -> Result<CheckHealthResult> {
        require_plugin(&req.plugin_context)?;
        if let Some(credentials) = Self::credentials(&mut req.plugin_context) {
            credentials.apply(&mut req.headers);
        }
        self.next.check_health(req).await
    }

    async fn collect_metrics(&self, req: CollectMetricsRequest) -> Result<CollectMetricsResult> {
        self.next.collect_metrics(req).await
    }

    async fn subscribe_stream(
        &self,
        req: SubscribeStreamRequest,
    ) -> Result<SubscribeStreamResponse> {
        require_path(&req.plugin_context, &req.path)?;
        self.next.subscribe_stream(req).await
    }

    async fn publish_stream(&self, req: PublishStreamRequest) -> Result<PublishStreamResponse> {
        require_path(&req.plugin_context, &req.path)?;
        self.next.publish_stream(req).await
    }

    async fn run_stream(
        &self,
        req: RunStreamRequest,
        sender: &dyn StreamPacketSender,
    ) -> Result<()> {
        require_path(&req.plugin_context, &req.path)?;
        self.next.run_stream(req, sender).await
    }
}
