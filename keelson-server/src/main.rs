//! Keelson control plane.
//!
//! Serves the cluster API over HTTP and drives container runtimes through
//! the orchestrator in `keelson-core`. Configuration is layered from CLI
//! flags, environment, an optional `keelson.toml`, and defaults.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use keelson_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, ConfigOverrides};
use keelson_server::{AppState, routes, startup};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "keelson-server")]
#[command(
    version,
    about = "Control plane for replicated PostgreSQL clusters on a container runtime"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Path to a keelson.toml file
    #[arg(long, env = "KEELSON_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file applied before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server host address
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// PostgreSQL URL for cluster records
    #[arg(long)]
    database_url: Option<String>,

    /// Redis URL for publishing cluster events
    #[arg(long)]
    redis_url: Option<String>,

    /// Container runtime CLI binary
    #[arg(long)]
    docker_binary: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keelson=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.serve.config.clone(),
        env_file: cli.serve.env_file.clone(),
        overrides: overrides(&cli.serve),
    })
    .load()
    .context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    if let Some(Command::Db(DbCommand::Migrate)) = cli.command {
        let database = config
            .database
            .as_ref()
            .context("db migrate requires DATABASE_URL or a [database] section")?;
        startup::connect_store(database).await?;
        info!("Database migrations applied successfully");
        return Ok(());
    }

    let service = startup::build_service(&config).await?;
    let shutdown = CancellationToken::new();
    let app = routes::create_router(AppState::new(service, shutdown.clone()));

    let addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "keelson server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server error")?;

    info!("keelson server stopped");
    Ok(())
}

fn overrides(args: &ServeArgs) -> ConfigOverrides {
    ConfigOverrides {
        server_host: args.host.clone(),
        server_port: args.port,
        database_url: args.database_url.clone(),
        redis_url: args.redis_url.clone(),
        docker_binary: args.docker_binary.clone(),
    }
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested; cancelling in-flight cluster operations");
    token.cancel();
}
