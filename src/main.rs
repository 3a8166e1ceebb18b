use std::sync::Arc;

use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::info;

use railway_conflict_core::api::{routes, AppState};
use railway_conflict_core::config::AppConfig;
use railway_conflict_core::engine::IntegrationEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::from_env()?);
    config.validate()?;

    tracing_subscriber::fmt()
        .with_max_level(
            config
                .logging
                .level
                .parse()
                .unwrap_or(tracing::Level::INFO),
        )
        .init();

    info!("Starting railway conflict management core");

    let raw_snapshot: serde_json::Value = {
        let raw = std::fs::read_to_string(&config.simulation.snapshot_path)?;
        serde_json::from_str(&raw)?
    };
    info!(path = %config.simulation.snapshot_path, "network snapshot loaded");

    let engine = IntegrationEngine::new(
        raw_snapshot,
        config.simulation.clone(),
        config.prediction.clone(),
    )?;
    info!(
        scenario = engine.simulator().config().scenario.as_str(),
        "simulation initialized"
    );

    let state = AppState {
        engine: Arc::new(RwLock::new(engine)),
    };

    let mut app = routes(state);
    if config.server.cors_enabled {
        app = app.layer(CorsLayer::permissive());
    }

    let bind_address = config.server_bind_address();
    info!("Server starting on {}", bind_address);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
