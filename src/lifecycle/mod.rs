//! Plugin lifecycle: the registry of known plugins and the supervisor that
//! keeps managed ones running.

pub mod registry;
pub mod supervisor;

pub use registry::{
    BackendFactoryProvider, DefaultFactoryProvider, HostEnv, PluginEnvProvider, PluginFactory,
    Registry, HOST_VERSION_ENV, LICENSE_EDITION_ENV,
};
pub use supervisor::{RunStatus, Supervisor, DEFAULT_TICK};
