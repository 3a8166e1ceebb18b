use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::error;

use crate::engine::IntegrationEngine;
use crate::sim::Scenario;

/// Shared handler state: the integration engine behind a writer lock. Tick
/// and restart take the write half; every read RPC observes the last
/// completed tick in parallel.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RwLock<IntegrationEngine>>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/simulation/state", get(get_state))
        .route("/api/simulation/tick", get(tick))
        .route("/api/simulation/start", post(start_simulation))
        .route("/api/prediction/:station", get(predictions_for_station))
        .route("/api/region/:region", get(predictions_for_region))
        .route("/api/conflicts/save", post(save_conflicts))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "railway-conflict-core",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// GET /api/simulation/state
async fn get_state(State(state): State<AppState>) -> Json<Value> {
    let engine = state.engine.read().await;
    Json(serde_json::to_value(engine.get_state()).unwrap_or_default())
}

/// GET /api/simulation/tick
async fn tick(State(state): State<AppState>) -> Json<Value> {
    let mut engine = state.engine.write().await;
    let view = engine.tick();
    Json(serde_json::to_value(view).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    seed: Option<u64>,
    scenario: Option<Scenario>,
}

/// POST /api/simulation/start
async fn start_simulation(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<Value>, StatusCode> {
    let mut engine = state.engine.write().await;
    match engine.start_simulation(request.seed, request.scenario) {
        Ok(()) => Ok(Json(json!({
            "status": "started",
            "scenario": engine.simulator().config().scenario.as_str(),
        }))),
        Err(e) => {
            error!(error = %e, "failed to restart simulation");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/prediction/:station
async fn predictions_for_station(
    State(state): State<AppState>,
    Path(station): Path<String>,
) -> Json<Value> {
    let engine = state.engine.read().await;
    let predictions = engine.predictions_for_station(&station);
    Json(json!({
        "station": station,
        "predictions": predictions,
    }))
}

/// GET /api/region/:region
async fn predictions_for_region(
    State(state): State<AppState>,
    Path(region): Path<String>,
) -> Json<Value> {
    let engine = state.engine.read().await;
    let predictions = engine.predictions_for_region(&region);
    Json(json!({
        "region": region,
        "predictions": predictions,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct SaveRequest {
    filename: Option<String>,
}

/// POST /api/conflicts/save
async fn save_conflicts(
    State(state): State<AppState>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<Value>, StatusCode> {
    let engine = state.engine.read().await;
    match engine.save_conflicts(request.filename.as_deref()) {
        Ok(path) => Ok(Json(json!({
            "status": "saved",
            "path": path.to_string_lossy(),
        }))),
        Err(e) => {
            error!(error = %e, "failed to save conflict document");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
