//! pg-listener service and tooling.
//!
//! `run` bridges the configured channel to the bus until SIGINT/SIGTERM or a
//! fatal reconnect failure (exit code 1). `emit` sends one notification and
//! `validate-config` checks the layered configuration.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use pg_listener::config::loader::sanitize_for_logging;
use pg_listener::config::{AppConfig, ConfigLoader, LoggingConfig};
use pg_listener::emitter::{PgNotifyEmitter, DEFAULT_MAX_PAYLOAD_SIZE};
use pg_listener::listener::{LoopSettings, PgNotificationSource, SubscriptionLoop};
use pg_listener::logging::{init_tracing, log_error, log_lifecycle};
use pg_listener::producer::{NatsConnector, ProducerGateway};

const COMPONENT: &str = "pg-listener";

#[derive(Parser)]
#[command(name = "pg-listener")]
#[command(about = "Bridge PostgreSQL notifications to a message bus topic")]
#[command(version)]
struct Cli {
    /// Base configuration file (default: config/pg-listener.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Deployment environment (default: PG_LISTENER_ENV, then APP_ENV)
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen and publish until stopped (default)
    Run(RunArgs),
    /// Send a single notification
    Emit(EmitArgs),
    /// Load and validate the configuration
    ValidateConfig,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Channel to listen on, overriding the configured one
    #[arg(long)]
    channel: Option<String>,
}

#[derive(Args)]
struct EmitArgs {
    /// Channel to notify
    #[arg(long)]
    channel: String,

    /// JSON payload
    #[arg(long)]
    payload: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(ref path) = cli.config {
        loader = loader.with_config_file(path);
    }
    if let Some(ref environment) = cli.environment {
        loader = loader.with_environment(environment);
    }

    let command = cli.command.unwrap_or(Commands::Run(RunArgs::default()));
    let channel_override = match &command {
        Commands::Run(args) => args.channel.clone(),
        _ => None,
    };

    // --channel applies before validation so it can supply a missing channel
    let loaded = loader
        .load_unvalidated()
        .map(|config| config.with_channel_override(channel_override));
    let logging_config = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_else(|_| LoggingConfig::default());
    init_tracing(&logging_config);

    let config = match loaded.and_then(|config| config.validate().map(|()| config)) {
        Ok(config) => config,
        Err(e) => {
            log_error(COMPONENT, "load configuration", &e.to_string(), None);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match command {
        Commands::Run(_) => run(config).await,
        Commands::Emit(args) => emit(config, args).await,
        Commands::ValidateConfig => validate_config(&config, loader.environment()),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error(COMPONENT, "run", &format!("{e:#}"), None);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    log_lifecycle("Starting", COMPONENT, Some(&config.database.channel));
    info!(
        channel = %config.database.channel,
        subject = %config.bus.subject(),
        bus_url = %config.bus.service_url,
        "Bridging notifications"
    );

    let result = bridge(&config).await;

    log_lifecycle("Exiting", COMPONENT, result.as_ref().err().map(|_| "fatal"));
    result
}

async fn bridge(config: &AppConfig) -> anyhow::Result<()> {
    // before the gateway: no exit path below may skip its close
    let source = PgNotificationSource::from_config(&config.database)
        .context("invalid database configuration")?;

    let gateway = ProducerGateway::connect(&NatsConnector, &config.bus, &config.retry.bus_connect)
        .await
        .context("failed to set up the bus producer")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping listener");
        let _ = shutdown_tx.send(true);
    });

    SubscriptionLoop::new(
        Arc::new(source),
        Arc::new(gateway),
        LoopSettings::from_config(config),
    )
    .with_shutdown(shutdown_rx)
    .run()
    .await
    .context("subscription loop terminated")?;

    Ok(())
}

async fn emit(config: AppConfig, args: EmitArgs) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.database.acquire_timeout())
        .connect_with(config.database.connect_options()?)
        .await
        .context("failed to connect to the database")?;

    let emitter = PgNotifyEmitter::new(pool.clone(), DEFAULT_MAX_PAYLOAD_SIZE);
    emitter.emit(&args.channel, &payload).await?;
    pool.close().await;

    info!(channel = %args.channel, "Notification sent");
    Ok(())
}

fn validate_config(config: &AppConfig, environment: &str) -> anyhow::Result<()> {
    let summary = serde_json::to_string_pretty(&sanitize_for_logging(config))?;

    println!("Configuration is valid");
    println!("   Environment: {environment}");
    println!("   Channel: {}", config.database.channel);
    println!("   Subject: {}", config.bus.subject());
    println!("   Stream: {}", config.bus.stream_name());
    println!("{summary}");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
