pub mod loader;
pub mod schema;

pub use loader::{default_search_paths, load_from_env_or_file, load_from_path, validate, ENV_PREFIX};
pub use schema::{HandshakeSettings, HostConfig, SupervisorSettings};
