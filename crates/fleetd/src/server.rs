//! Serve mode: opens the store and runs the HTTP API until Ctrl-C.

use fleet_api::{build_router, ApiState};
use fleet_core::FleetConfig;
use fleet_state::StateStore;
use tracing::{error, info};

pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!("Fleetgate daemon starting");

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let state = ApiState::new(store).with_stale_write_retries(config.handler.stale_write_retries);
    info!(
        retries = config.handler.stale_write_retries,
        "protocol handler initialized"
    );

    let router = build_router(state);
    let addr = config.server.listen;
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Fleetgate daemon stopped");
    Ok(())
}
