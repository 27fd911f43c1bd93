use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use photo_ingest::api::{start_api_server, AppState};
use photo_ingest::{Config, Pipeline, S3ObjectStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "photo-ingest")]
#[command(about = "Photo ingestion: renditions, capture metadata and duplicate handling")]
#[command(version)]
struct Cli {
    /// Force debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one notification document and print the JSON response
    Invoke {
        /// Notification file, or `-` for stdin
        event: PathBuf,
    },
    /// Serve the HTTP invoke endpoint
    Serve,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load().context("Failed to load configuration")?;
    config.service.verbose |= cli.verbose;

    // Initialize logging
    init_tracing(config.log_level(), config.service.json_logs);

    let config = Arc::new(config);

    match cli.command {
        Command::Invoke { event } => invoke(config, event).await,
        Command::Serve => serve(config).await.map(|_| ExitCode::SUCCESS),
    }
}

/// Run a single job; exit status is 1 only for error responses
async fn invoke(config: Arc<Config>, event_path: PathBuf) -> Result<ExitCode> {
    let raw = read_event(&event_path).await?;

    let store = Arc::new(S3ObjectStore::new(&config.s3).await);
    let pipeline = Pipeline::new(config, store);

    let response = pipeline.handle_bytes(&raw).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&response).context("Failed to serialize response")?
    );

    Ok(if response.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn read_event(path: &PathBuf) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut raw = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut raw)
            .await
            .context("Failed to read event from stdin")?;
        Ok(raw)
    } else {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read event file {}", path.display()))
    }
}

async fn serve(config: Arc<Config>) -> Result<()> {
    info!(
        service = %config.service.name,
        "Starting photo ingest service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(S3ObjectStore::new(&config.s3).await);
    let pipeline = Arc::new(Pipeline::new(config.clone(), store));
    let state = AppState::new(
        pipeline.clone(),
        config.service.max_concurrent_jobs,
        config.service.name.clone(),
    );

    #[cfg(feature = "kafka")]
    let consumer_handle = match &config.kafka {
        Some(kafka_config) => {
            let consumer = photo_ingest::NotificationConsumer::new(
                kafka_config,
                pipeline.clone(),
                state.permits.clone(),
            )
            .context("Failed to initialize Kafka consumer")?;
            Some(tokio::spawn(async move {
                if let Err(e) = consumer.run().await {
                    error!(error = %e, "Kafka consumer error");
                }
            }))
        }
        None => None,
    };

    if let Err(e) = start_api_server(
        state,
        &config.service.host,
        config.service.port,
        shutdown_signal(),
    )
    .await
    {
        error!(error = %e, "API server error");
    }

    info!("Shutting down photo ingest service");

    #[cfg(feature = "kafka")]
    if let Some(handle) = consumer_handle {
        handle.abort();
    }

    info!("Photo ingest service stopped");

    Ok(())
}

/// Initialize tracing/logging. Logs go to stderr, stdout carries responses.
fn init_tracing(log_level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
