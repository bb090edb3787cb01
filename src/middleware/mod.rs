//! Client middleware
//!
//! A middleware wraps the next client in the chain and returns a client with
//! the same interface. [`build_chain`] composes them so the first one listed
//! is outermost: it sees each request first and each result last.

use std::sync::Arc;

use crate::backend::{PluginClient, PluginContext};
use crate::error::{PluginError, Result};

pub mod forward_credentials;
pub mod registry_client;
pub mod session;

pub use forward_credentials::{forward_credentials, ForwardCredentials};
pub use registry_client::RegistryClient;
pub use session::{CallerSession, OAuthToken};

pub type Middleware = Arc<dyn Fn(Arc<dyn PluginClient>) -> Arc<dyn PluginClient> + Send + Sync>;

/// Wraps `terminal` in `middlewares`, first entry outermost.
pub fn build_chain(
    middlewares: &[Middleware],
    terminal: Arc<dyn PluginClient>,
) -> Arc<dyn PluginClient> {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware(next))
}

/// Ordered middleware list, built around a terminal client on demand.
#[derive(Clone, Default)]
pub struct ClientChain {
    middlewares: Vec<Middleware>,
}

impl ClientChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn build(&self, terminal: Arc<dyn PluginClient>) -> Arc<dyn PluginClient> {
        build_chain(&self.middlewares, terminal)
    }
}

/// Requests must name the plugin they target.
pub(crate) fn require_plugin(context: &PluginContext) -> Result<()> {
    if context.plugin_id.is_empty() {
        return Err(PluginError::InvalidArgument(
            "request has no plugin id".to_string(),
        ));
    }
    Ok(())
}

/// Stream requests must also name a channel path.
pub(crate) fn require_path(context: &PluginContext, path: &str) -> Result<()> {
    require_plugin(context)?;
    if path.is_empty() {
        return Err(PluginError::InvalidArgument(
            "stream request has no path".to_string(),
        ));
    }
    Ok(())
}
