//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::alert::{AlertError, AlertStatus};
use crate::mitigate::{MitigationError, MitigationStatus};
use crate::pipeline::BehaviorEvent;

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_event))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{id}/close", post(close_alert))
        .route("/mitigations", get(list_mitigations))
        .route("/mitigations/{id}/revoke", post(revoke_mitigation))
        .route("/metrics/pipeline", get(pipeline_metrics))
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

fn error_body(message: String) -> Json<Value> {
    Json(json!({ "data": null, "meta": { "error": message } }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "profiles_tracked": state.engine.store.profile_count(),
        }),
        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }),
    )
}

/// Accept one behavioral event into the ingestion queue. Returns 202; the
/// pipeline processes asynchronously.
async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<BehaviorEvent>,
) -> (StatusCode, Json<Value>) {
    match state.events_tx.try_send(event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "data": { "accepted": true }, "meta": {} })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("ingestion queue full".to_string()),
        ),
    }
}

#[derive(Deserialize)]
struct AlertFilter {
    entity_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(filter): Query<AlertFilter>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = match filter.status.as_deref() {
        Some(s) => Some(s.parse::<AlertStatus>().map_err(bad_request)?),
        None => None,
    };
    let limit = filter.limit.unwrap_or(50).min(500);
    let alerts = state
        .engine
        .alerts
        .list(filter.entity_id.as_deref(), status, limit)
        .map_err(internal)?;
    let total = alerts.len();
    Ok(envelope(json!(alerts), json!({ "total": total })))
}

#[derive(Deserialize)]
struct ActorBody {
    actor: Option<String>,
}

/// Actor from an optional `{"actor": ...}` JSON body, defaulting to "api".
fn actor_from(body: &axum::body::Bytes) -> String {
    serde_json::from_slice::<ActorBody>(body)
        .ok()
        .and_then(|b| b.actor)
        .unwrap_or_else(|| "api".to_string())
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let actor = actor_from(&body);
    let alert = state
        .engine
        .alerts
        .acknowledge(id, &actor)
        .map_err(alert_error)?;
    Ok(envelope(json!(alert), json!({})))
}

async fn close_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.engine.alerts.close(id).map_err(alert_error)?;
    Ok(envelope(json!({ "closed": true }), json!({})))
}

#[derive(Deserialize)]
struct MitigationFilter {
    entity_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_mitigations(
    State(state): State<AppState>,
    Query(filter): Query<MitigationFilter>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = match filter.status.as_deref() {
        Some(s) => Some(s.parse::<MitigationStatus>().map_err(bad_request)?),
        None => None,
    };
    let limit = filter.limit.unwrap_or(50).min(500);
    let mitigations = state
        .engine
        .mitigations
        .list(filter.entity_id.as_deref(), status, limit)
        .map_err(internal)?;
    let total = mitigations.len();
    Ok(envelope(json!(mitigations), json!({ "total": total })))
}

async fn revoke_mitigation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let actor = actor_from(&body);
    let mitigation = state
        .engine
        .mitigations
        .revoke(id, &actor)
        .map_err(mitigation_error)?;
    Ok(envelope(json!(mitigation), json!({})))
}

async fn pipeline_metrics(State(state): State<AppState>) -> Json<Value> {
    envelope(
        state.engine.metrics.snapshot(),
        json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
    )
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, error_body(message))
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string()))
}

fn alert_error(e: AlertError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        AlertError::NotFound(_) => StatusCode::NOT_FOUND,
        AlertError::AlreadyClosed(_) => StatusCode::CONFLICT,
        AlertError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error_body(e.to_string()))
}

fn mitigation_error(e: MitigationError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        MitigationError::NotFound(_) => StatusCode::NOT_FOUND,
        MitigationError::AlreadyFinished(_) => StatusCode::CONFLICT,
        MitigationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error_body(e.to_string()))
}
