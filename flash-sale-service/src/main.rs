use anyhow::Result;
use clap::Parser;
use flash_sale_service::api;
use flash_sale_service::config::Config;
use flash_sale_service::repository::{self, PgOrderRepository};
use flash_sale_service::reservation::RedisReservationStore;
use flash_sale_service::Pipeline;
use shared::ReservationStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Config::parse();

    // Run migrations first
    info!("Running database migrations...");
    let database_url = config.database_url.clone();
    tokio::task::spawn_blocking(move || repository::run_migrations(&database_url)).await??;
    info!("Migrations completed successfully");

    let pool = repository::build_pool(&config.database_url, config.db_pool_size).await?;
    let durable = Arc::new(PgOrderRepository::new(pool));
    info!("Connected to postgres");

    let reservations = Arc::new(RedisReservationStore::connect(&config.redis_url, config.idempotency_ttl()).await?);
    info!("Connected to redis");

    if let Some((item_id, stock)) = config.seed() {
        reservations.set_stock(item_id, stock).await?;
        durable.seed_inventory(item_id, stock).await?;
        info!(item_id, stock, "Initialized stock");
    }

    let pipeline = Pipeline::start(reservations, durable, config.pipeline());

    let app = api::create_router(api::AppState {
        service: pipeline.service(),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Flash sale service listening on http://0.0.0.0:{}/api/purchase", config.port);

    // The server stops taking requests before the queue is closed, so no
    // purchase can race the shutdown.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");

    let stats = pipeline.shutdown().await;
    if stats.compensation_failures > 0 {
        tracing::error!(
            compensation_failures = stats.compensation_failures,
            "Reservation store is short relative to durable inventory; reconcile before next sale"
        );
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutting down...");
}
