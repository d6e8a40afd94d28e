/**
 * HTTP API - Lecture de la flotte réconciliée pour les dashboards
 *
 * ROUTES :
 * - GET  /health                 process vivant (sans auth)
 * - GET  /fleet                  snapshot complet (appareils + stats + révision)
 * - GET  /fleet/stats            stats dérivées seules
 * - GET  /devices/{id}           un appareil
 * - GET  /connection             état push, compteurs des canaux, liveness
 * - GET  /debug/recent?limit=N   lignes brutes de la table
 * - POST /debug/simulate         lecture manuelle via la dédup
 *
 * SÉCURITÉ : `x-api-key` doit correspondre à la clé configurée sur toutes
 * les routes sauf /health. Sans clé configurée, tout est refusé.
 */

use crate::engine::{EngineStatus, TelemetryEngine};
use crate::fleet::FleetSnapshot;
use crate::models::{Device, DeviceId, FleetStats};
use crate::reconcile::IngestOutcome;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

const MAX_RECENT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TelemetryEngine>,
    pub api_key: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/fleet", get(get_fleet))
        .route("/fleet/stats", get(get_stats))
        .route("/devices/{id}", get(get_device))
        .route("/connection", get(get_connection))
        .route("/debug/recent", get(get_recent))
        .route("/debug/simulate", post(simulate))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("BINTEL_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

// GET /fleet
async fn get_fleet(State(app): State<AppState>) -> Json<FleetSnapshot> {
    Json(app.engine.snapshot())
}

// GET /fleet/stats
async fn get_stats(State(app): State<AppState>) -> Json<FleetStats> {
    Json(app.engine.stats())
}

// GET /devices/{id}
async fn get_device(State(app): State<AppState>, Path(id): Path<DeviceId>) -> Result<Json<Device>, StatusCode> {
    app.engine.device(id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// GET /connection
async fn get_connection(State(app): State<AppState>) -> Json<EngineStatus> {
    Json(app.engine.status())
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    limit: Option<usize>,
}

// GET /debug/recent?limit=N
async fn get_recent(
    State(app): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit = params.limit.unwrap_or(20).clamp(1, MAX_RECENT);
    match app.engine.recent_rows(limit).await {
        Ok(rows) => Ok(Json(serde_json::json!({ "count": rows.len(), "rows": rows }))),
        Err(e) => {
            warn!(error = %e, "recent rows query failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SimulateBody {
    bin_id: DeviceId,
    fill_level: f64,
    battery_level: Option<f64>,
}

// POST /debug/simulate
async fn simulate(
    State(app): State<AppState>,
    Json(body): Json<SimulateBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !body.fill_level.is_finite() {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "ok": false, "msg": "fill_level must be a number" })));
    }
    match app.engine.simulate(body.bin_id, body.fill_level, body.battery_level) {
        IngestOutcome::Applied(device) => (StatusCode::OK, Json(serde_json::json!({ "ok": true, "device": device }))),
        IngestOutcome::Duplicate => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "ok": false, "msg": "stale or duplicate reading" })),
        ),
        IngestOutcome::UnknownDevice => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "ok": false, "msg": format!("unknown bin {}", body.bin_id) })),
        ),
    }
}
