use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use keelson_core::{OrchestratorConfig, ReadinessPolicy};
use thiserror::Error;
use tracing::debug;

use crate::models::{
    Config, ConfigMetadata, ConfigWarnings, DatabaseConfig, RedisConfig,
    RuntimeConfig, ServerConfig,
};
use crate::sources::{ConfigOverrides, EnvConfig, FileConfig};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["keelson.toml", "config/keelson.toml"];
const DEFAULT_REDIS_CHANNEL: &str = "keelson:cluster-events";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.options.overrides = overrides;
        self
    }

    /// Applies `.env`, reads the process environment, and composes.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };
        let mut load = self.load_from_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Composes from an already gathered environment layer; the process
    /// environment is not consulted.
    pub fn load_from_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No keelson.toml found; using environment variables and defaults",
                "Create keelson.toml or set KEELSON_CONFIG to point at one",
            );
        }
        let config = compose(
            file.unwrap_or_default(),
            env,
            &self.options.overrides,
            config_path,
            &mut warnings,
        )?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        debug!(path = %path.display(), "reading configuration file");
        let contents = fs::read_to_string(&path).map_err(|source| {
            ConfigLoadError::Io {
                path: path.clone(),
                source,
            }
        })?;
        let file: FileConfig = toml::from_str(&contents).map_err(|source| {
            ConfigLoadError::Parse {
                path: path.clone(),
                source,
            }
        })?;
        Ok((Some(file), Some(path)))
    }
}

fn compose(
    file: FileConfig,
    env: EnvConfig,
    overrides: &ConfigOverrides,
    config_path: Option<PathBuf>,
    warnings: &mut ConfigWarnings,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        runtime: file_runtime,
        orchestrator: file_orch,
    } = file;

    let defaults = ServerConfig::default();
    let server = ServerConfig {
        host: overrides
            .server_host
            .clone()
            .or(env.server_host)
            .or(file_server.host)
            .unwrap_or(defaults.host),
        port: match overrides.server_port {
            Some(port) => port,
            None => parse_env("SERVER_PORT", env.server_port)?
                .or(file_server.port)
                .unwrap_or(defaults.port),
        },
    };

    let file_database = file_database.unwrap_or_default();
    let database_url = overrides
        .database_url
        .clone()
        .or(env.database_url)
        .or(file_database.url);
    let database = match database_url {
        Some(url) => Some(DatabaseConfig {
            url,
            max_connections: parse_env(
                "DATABASE_MAX_CONNECTIONS",
                env.database_max_connections,
            )?
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: duration(
                "database.acquire_timeout",
                None,
                file_database.acquire_timeout,
            )?
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        }),
        None => {
            warnings.push_with_hint(
                "No database configured; cluster records are kept in memory",
                "Set DATABASE_URL to persist clusters across restarts",
            );
            None
        }
    };

    let (file_redis_url, file_redis_channel) = match file_redis {
        Some(redis) => (Some(redis.url), redis.channel),
        None => (None, None),
    };
    let redis = overrides
        .redis_url
        .clone()
        .or(env.redis_url)
        .or(file_redis_url)
        .map(|url| RedisConfig {
            url,
            channel: env
                .redis_channel
                .or(file_redis_channel)
                .unwrap_or_else(|| DEFAULT_REDIS_CHANNEL.to_string()),
        });

    let runtime = RuntimeConfig {
        docker_binary: overrides
            .docker_binary
            .clone()
            .or(env.docker_binary)
            .or(file_runtime.docker_binary)
            .unwrap_or_else(|| RuntimeConfig::default().docker_binary),
    };

    let base = OrchestratorConfig::default();
    let readiness = ReadinessPolicy::new(
        duration(
            "orchestrator.readiness_timeout",
            env.readiness_timeout,
            file_orch.readiness_timeout,
        )?
        .unwrap_or(base.readiness.timeout),
        duration(
            "orchestrator.readiness_interval",
            env.readiness_interval,
            file_orch.readiness_interval,
        )?
        .unwrap_or(base.readiness.interval),
    );
    let promotion = ReadinessPolicy::new(
        duration(
            "orchestrator.promotion_timeout",
            env.promotion_timeout,
            file_orch.promotion_timeout,
        )?
        .unwrap_or(base.promotion.timeout),
        readiness.interval,
    );
    let orchestrator = OrchestratorConfig {
        name_prefix: env
            .name_prefix
            .or(file_orch.name_prefix)
            .unwrap_or(base.name_prefix),
        image: env
            .postgres_image
            .or(file_runtime.image)
            .unwrap_or(base.image),
        max_nodes: parse_env("KEELSON_MAX_NODES", env.max_nodes)?
            .or(file_orch.max_nodes)
            .unwrap_or(base.max_nodes),
        admin_user: file_orch.admin_user.unwrap_or(base.admin_user),
        replication_user: file_orch
            .replication_user
            .unwrap_or(base.replication_user),
        readiness,
        promotion,
        restart_settle: duration(
            "orchestrator.restart_settle",
            env.restart_settle,
            file_orch.restart_settle,
        )?
        .unwrap_or(base.restart_settle),
        event_timeout: duration(
            "orchestrator.event_timeout",
            env.event_timeout,
            file_orch.event_timeout,
        )?
        .unwrap_or(base.event_timeout),
        default_log_tail: parse_env("KEELSON_LOG_TAIL", env.default_log_tail)?
            .or(file_orch.default_log_tail)
            .unwrap_or(base.default_log_tail),
    };

    validate(&orchestrator)?;

    Ok(Config {
        server,
        database,
        redis,
        runtime,
        orchestrator,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    })
}

fn validate(config: &OrchestratorConfig) -> Result<(), ConfigLoadError> {
    let invalid = |key: &'static str, reason: &str| ConfigLoadError::Invalid {
        key,
        reason: reason.to_string(),
    };
    if config.name_prefix.trim().is_empty() {
        return Err(invalid("orchestrator.name_prefix", "must not be empty"));
    }
    if config.max_nodes == 0 {
        return Err(invalid("orchestrator.max_nodes", "must be at least 1"));
    }
    if config.readiness.interval.is_zero()
        || config.readiness.interval >= config.readiness.timeout
    {
        return Err(invalid(
            "orchestrator.readiness_interval",
            "must be non-zero and shorter than the readiness timeout",
        ));
    }
    if config.promotion.interval >= config.promotion.timeout {
        return Err(invalid(
            "orchestrator.promotion_timeout",
            "must be longer than the readiness interval",
        ));
    }
    if config.default_log_tail == 0 {
        return Err(invalid("orchestrator.default_log_tail", "must be at least 1"));
    }
    Ok(())
}

fn parse_env<T: FromStr>(
    key: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigLoadError> {
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|_| ConfigLoadError::InvalidValue {
            key,
            value,
        })
    })
    .transpose()
}

/// Environment wins over file.
fn duration(
    key: &'static str,
    env: Option<String>,
    file: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    env.or(file)
        .map(|value| {
            humantime::parse_duration(value.trim()).map_err(|source| {
                ConfigLoadError::InvalidDuration { key, value, source }
            })
        })
        .transpose()
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid duration '{value}' for {key}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
