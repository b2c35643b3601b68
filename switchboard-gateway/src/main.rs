//! Switchboard gateway binary.
//!
//! Loads configuration (TOML file if present, defaults plus environment
//! otherwise), starts the HTTP server on the configured address (port
//! 7070 by default), and shuts the background tasks down cooperatively on
//! SIGINT/SIGTERM.

use clap::Parser;
use std::net::SocketAddr;

use switchboard_gateway::config::Config;
use switchboard_gateway::server::create_server;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "switchboard.toml")]
    config: String,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        tracing::warn!(path = %args.config, "config file not found; using defaults");
        Config::from_env()?
    };
    config.validate()?;

    let gateway = create_server(config.clone()).await?;
    let app = gateway.app.clone();

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("starting switchboard gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
