//! Mentora Monitoring - Main entry point

use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mentora_monitoring::{
    config::MonitoringConfig, dashboard::MonitoringService, error::Result, server, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mentora-monitoring")
        .version(VERSION)
        .about("Mentora Monitoring - metrics, health checks, alerting and workflow tracking")
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level override (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("HTTP port override"),
        )
        .arg(
            Arg::new("validate-config")
                .long("validate-config")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let mut config = MonitoringConfig::load()?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(port) = matches.get_one::<String>("port") {
        config.prometheus.port = port
            .parse()
            .map_err(|_| mentora_monitoring::MonitoringError::validation(
                format!("invalid port: {}", port),
            ))?;
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("configuration error: {}", problem);
        }
        return Err(mentora_monitoring::MonitoringError::validation(format!(
            "{} configuration error(s)",
            problems.len()
        )));
    }
    if matches.get_flag("validate-config") {
        println!("configuration OK");
        return Ok(());
    }

    init_logging(&config)?;
    info!(version = VERSION, "Starting Mentora monitoring service");

    let service = MonitoringService::new(config.clone());
    service.start().await?;

    let port = config.prometheus.port;
    let shutdown = setup_shutdown_signal();
    match server::serve(service.clone(), port, shutdown).await {
        Ok(()) => info!("HTTP server stopped gracefully"),
        Err(e) => error!(error = %e, "HTTP server stopped with error"),
    }

    service.shutdown().await;
    info!("Mentora monitoring service stopped");
    Ok(())
}

/// Initialize logging from the logging config
fn init_logging(config: &MonitoringConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mentora_monitoring={}", config.logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
