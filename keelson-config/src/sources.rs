use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Raw configuration as written in `keelson.toml`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    pub database: Option<FileDatabaseConfig>,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub runtime: FileRuntimeConfig,
    #[serde(default)]
    pub orchestrator: FileOrchestratorConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileRedisConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileRuntimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Durations are humantime strings such as `"90s"` or `"500ms"`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileOrchestratorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_settle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_log_tail: Option<usize>,
}

/// Environment-derived configuration values. Numbers stay as strings here so
/// a malformed value is reported instead of silently ignored.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<String>,
    pub redis_url: Option<String>,
    pub redis_channel: Option<String>,
    pub docker_binary: Option<String>,
    pub postgres_image: Option<String>,
    pub name_prefix: Option<String>,
    pub max_nodes: Option<String>,
    pub readiness_timeout: Option<String>,
    pub readiness_interval: Option<String>,
    pub promotion_timeout: Option<String>,
    pub restart_settle: Option<String>,
    pub event_timeout: Option<String>,
    pub default_log_tail: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the environment layer from any variable source. Blank values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            config_path: var("KEELSON_CONFIG").map(PathBuf::from),
            server_host: var("SERVER_HOST"),
            server_port: var("SERVER_PORT"),
            database_url: var("DATABASE_URL"),
            database_max_connections: var("DATABASE_MAX_CONNECTIONS"),
            redis_url: var("REDIS_URL"),
            redis_channel: var("REDIS_EVENT_CHANNEL"),
            docker_binary: var("DOCKER_BINARY"),
            postgres_image: var("KEELSON_POSTGRES_IMAGE"),
            name_prefix: var("KEELSON_NAME_PREFIX"),
            max_nodes: var("KEELSON_MAX_NODES"),
            readiness_timeout: var("KEELSON_READINESS_TIMEOUT"),
            readiness_interval: var("KEELSON_READINESS_INTERVAL"),
            promotion_timeout: var("KEELSON_PROMOTION_TIMEOUT"),
            restart_settle: var("KEELSON_RESTART_SETTLE"),
            event_timeout: var("KEELSON_EVENT_TIMEOUT"),
            default_log_tail: var("KEELSON_LOG_TAIL"),
        }
    }
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub docker_binary: Option<String>,
}
