mod cache;
mod config;
mod conn;
mod error;
mod hooks;
mod hub;
mod message;
mod push;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use config::{generate_config_template, Cli, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "courier_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("courier-server v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(&cli.config)?);
    let services = config.all_services();
    if services.is_empty() {
        tracing::warn!(
            "no services configured, connections will use the default service config"
        );
    } else {
        tracing::info!(services = %services.join(", "), "configured services");
    }

    let app_state = state::AppState::new(config.clone());
    let app = routes::build_router(app_state);

    // Bind and serve
    let listener = TcpListener::bind(&config.http_addr).await?;
    tracing::info!("Listening on {}", config.http_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
