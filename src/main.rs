//! SmartAmp - TCP control and content-delivery server for networked amplifiers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use smartamp as app;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use app::config::{AppConfig, ConfigLoadResult, LoggingConfig, ServerConfig};
use app::server::{SessionRegistry, TcpServer};

/// TCP control and content-delivery server for networked amplifiers.
#[derive(Parser)]
#[command(name = "smartamp")]
struct Cli {
    /// Use config.toml from current directory (dev mode)
    #[arg(long)]
    dev: bool,

    /// Explicit config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the listener port
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Determine config path based on mode
    let config_path = match (&cli.config, cli.dev) {
        (Some(path), _) => path.clone(),
        (None, true) => PathBuf::from("config.toml"),
        (None, false) => AppConfig::default_path(),
    };

    let (mut config, config_missing) = match AppConfig::try_load(&config_path) {
        ConfigLoadResult::Loaded(config) => (config, false),
        ConfigLoadResult::Missing => (AppConfig::default(), true),
        ConfigLoadResult::Invalid(e) => {
            return Err(e).with_context(|| format!("Invalid config at {}", config_path.display()));
        }
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate().context("Invalid command line override")?;

    // Guard flushes the file writer; keep it for the whole process
    let _log_guard = init_logging(&config.logging).context("Failed to set up logging")?;

    tracing::info!("SmartAmp server starting...");
    tracing::info!("Config path: {:?}", config_path);
    if config_missing {
        tracing::info!("Config missing, using defaults");
    }

    let runtime = build_runtime(&config.server)?;
    runtime.block_on(serve(config))
}

/// Console logging, plus a daily rolling file when a log directory is set.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Cannot create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

fn build_runtime(server: &ServerConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if server.worker_threads > 0 {
        builder.worker_threads(server.worker_threads);
    }
    builder.build().context("Failed to create tokio runtime")
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let server = TcpServer::bind(&config.server, &config.delivery, registry).await?;

    server
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
                Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
            }
        })
        .await?;

    tracing::info!("SmartAmp server stopped");
    Ok(())
}
