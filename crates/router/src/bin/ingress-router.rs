//! Ingress router binary

use anyhow::Result;
use clap::Parser;
use ingress_router::common::ValidateConfig;
use ingress_router::telemetry::init_tracing;
use ingress_router::{ListenAddrs, Router, RouterConfig, RouterServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How long in-flight requests get to finish on shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Ingress router - DNS, HTTP redirect and HTTPS reverse proxy for a cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        RouterConfig::load_from_file(config_path)?
    } else {
        RouterConfig::load()?
    };
    config.validate()?;

    init_tracing(&config.log_level)?;

    info!("Starting ingress router");
    info!("Configuration: {:#?}", config);

    let router = Router::new(&config)?;
    router.start().await?;

    let server = RouterServer::bind(Arc::new(router), ListenAddrs::default()).await?;

    let result = tokio::select! {
        result = server.serve() => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    if let Err(e) = server.shutdown(SHUTDOWN_DEADLINE).await {
        error!("Shutdown did not complete: {}", e);
    }

    result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
