//! Prometheus exporter for PurpleAir sensors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use purple_exporter::config::LogFormat;
use purple_exporter::{
    ExporterConfig, HttpServer, MetricsRegistry, ScrapeCycle, Scheduler, SensorClient,
    interval_ticker, mapping,
};

/// Prometheus exporter for PurpleAir air-quality sensors.
#[derive(Parser, Debug)]
#[command(name = "purple-exporter")]
#[command(about = "Export PurpleAir sensor readings as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Sensor address as host:port (repeatable).
    #[arg(long = "sensor-addr", value_name = "HOST:PORT")]
    sensor_addr: Vec<String>,

    /// HTTP listen address [default: 0.0.0.0:8080].
    #[arg(long)]
    listen: Option<String>,

    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?
    } else {
        ExporterConfig::default()
    };

    config.apply_overrides(args.sensor_addr, args.listen);
    config.validate()?;

    // Initialize logging
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(config.logging.level.as_str())
        .parse()
        .unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("purple_exporter={}", log_level).parse()?);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!(
        sensors = config.sensors.addresses.len(),
        interval_secs = config.sensors.poll_interval_secs,
        "Starting PurpleAir exporter"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the registry and register every metric before the first write
    let prefix = config.prometheus.prefix.clone();
    let registry = Arc::new(MetricsRegistry::new(&prefix));
    mapping::register_metrics(&registry, &prefix)?;

    // Bind the HTTP listener before any scraping
    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let http_server = HttpServer::bind(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    )
    .await?;

    // Create the scrape pipeline
    let client = Arc::new(SensorClient::new(config.sensors.timeout())?);
    let cycle = ScrapeCycle::new(
        client,
        registry.clone(),
        config.sensors.addresses.clone(),
        &prefix,
    );
    let scheduler = Scheduler::new(cycle, interval_ticker(config.sensors.poll_interval()));

    // Start HTTP server
    let mut http_task = tokio::spawn(http_server.run(shutdown_rx.clone()));

    // Start scheduler
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // Wait for a shutdown signal or an early HTTP server exit
    let server_failure = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            None
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down...");
            None
        }
        result = &mut http_task => {
            let err = server_exit_error(result);
            error!("{:#}", err);
            Some(err)
        }
    };

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The in-flight cycle is bounded by the request timeout.
    let grace = config.sensors.timeout() + Duration::from_secs(5);
    let _ = tokio::time::timeout(grace, async {
        match scheduler_task.await {
            Ok(state) => info!(state = %state, "Scheduler finished"),
            Err(e) => error!("Scheduler task failed: {}", e),
        }
        if server_failure.is_none() {
            match http_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("HTTP server error: {:#}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
    })
    .await;

    let stats = registry.stats();
    info!(
        cycles = stats.cycles_completed,
        fetch_successes = stats.fetch_successes,
        fetch_failures = stats.fetch_failures,
        series_count = registry.series_count(),
        "Final statistics"
    );

    if let Some(err) = server_failure {
        return Err(err);
    }

    info!("Exporter stopped");
    Ok(())
}

/// Turn an HTTP server exit that happened before shutdown into an error.
fn server_exit_error(result: Result<anyhow::Result<()>, JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("HTTP server stopped unexpectedly"),
        Ok(Err(e)) => e.context("HTTP server failed"),
        Err(e) => anyhow::anyhow!("HTTP server task failed: {}", e),
    }
}

/// Resolve on SIGTERM; never resolves where that signal is unavailable.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
