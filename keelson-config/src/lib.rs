//! Configuration loading for Keelson binaries.
//!
//! Values are layered, highest precedence first: explicit overrides (CLI
//! flags), environment variables (after `.env` is applied), the TOML file,
//! then built-in defaults.
#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, ConfigWarning, ConfigWarnings, DatabaseConfig,
    RedisConfig, RuntimeConfig, ServerConfig,
};
pub use sources::{ConfigOverrides, EnvConfig, FileConfig};
