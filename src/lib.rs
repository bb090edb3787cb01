pub mod backend;
pub mod config;
pub mod error;
pub mod instrumentation;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod plugin;
pub mod protocol;
pub mod stream;

#[cfg(test)]
pub mod test_utils;

pub use error::{PluginError, Result};
