//! VenuePass API server entrypoint

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use venuepass_api::{create_router, AppState, Config};
use venuepass_billing::BillingService;
use venuepass_shared::db::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (local development)
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting VenuePass API");

    // Migrations run on a dedicated single-connection pool so a slow
    // migration never starves request traffic during rollout.
    {
        let migration_pool = create_migration_pool(&config.database_url)
            .await
            .context("Failed to connect for migrations")?;
        run_migrations(&migration_pool)
            .await
            .context("Failed to run database migrations")?;
        migration_pool.close().await;
    }

    let pool = create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let billing = BillingService::from_env(pool.clone())
        .context("Failed to initialize billing services")?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config, billing);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;

    tracing::info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}
