//! Cromos trade server

use clap::Parser;
use cromos_trade::api::create_router;
use cromos_trade::config::ServerConfig;
use cromos_trade::db::Database;
use cromos_trade::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = ServerConfig::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(&config.log_level)?)
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Cromos - Direct Trade Settlement v{:<13} ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════════════════════════╝");

    // Initialize database
    info!("Connecting to database...");
    let db = Database::new(&config.database_url, config.max_connections).await?;
    info!("Database connected");

    if config.skip_migrations {
        info!("Skipping migrations");
    } else {
        db.run_migrations(&config.migrations_dir).await?;
    }

    // Create application state
    let state = Arc::new(AppState::new(Arc::new(db), config.settlement()));

    // Create router with all API endpoints
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting API server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
