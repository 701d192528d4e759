pub mod loader;
pub mod schema;

pub use loader::{load_from_env_or_file, load_from_path, user_config_dir, validate};
pub use schema::{
    AdapterConfig, ApiConfig, BreakpointConfig, CertificateConfig, Config, EventsConfig,
    LogFormat, LoggingConfig, SessionConfig,
};
