//! Control API route handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use relay_core::UserId;
use relay_sessions::{SessionError, StartOutcome};
use relay_telemetry::LogQuery;

use crate::error::ApiError;
use crate::server::AppState;

/// Pull `user_id` out of a JSON body. A body that is not JSON at all
/// counts as missing the id.
fn user_id_from(body: &Bytes) -> Result<UserId, ApiError> {
    let body: Value = serde_json::from_slice(body).map_err(|_| ApiError::MissingUserId)?;
    let value = body.get("user_id").ok_or(ApiError::MissingUserId)?;
    Ok(UserId::from_json(value)?)
}

/// `POST /start-client`
pub async fn start_client(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let user_id = user_id_from(&body)?;
    match state.registry.start(user_id.clone()) {
        StartOutcome::Initialized => Ok(Json(json!({ "message": "Client initialized" }))),
        StartOutcome::AlreadyRunning => {
            debug!(user_id = %user_id, "start requested for running client");
            Ok(Json(json!({ "message": "Client already running" })))
        }
        StartOutcome::CleanupPending => {
            info!(user_id = %user_id, "start refused, cleanup pending");
            Err(ApiError::CleanupPending)
        }
        StartOutcome::InvalidUserId => Err(ApiError::InvalidUserId),
    }
}

/// `GET /qr/{user_id}`
pub async fn qr(State(state): State<AppState>, Path(user_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let user_id = UserId::parse(&user_id)?;
    Ok(match state.registry.pairing(&user_id) {
        Some(qr) => Json(json!({ "qr": qr })),
        None => Json(json!({ "message": "QR not generated yet" })),
    })
}

/// `POST /run-client-task`
pub async fn run_client_task(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let user_id = user_id_from(&body)?;
    match state.sync.sync(&user_id).await {
        Ok(contacts) => {
            debug!(user_id = %user_id, contacts = contacts.len(), "sync request done");
            Ok(Json(json!({ "message": "Contacts sent to Laravel" })))
        }
        Err(e) => {
            if !matches!(e, SessionError::NotRunning(_)) {
                error!(user_id = %user_id, error = %e, "contact sync failed");
            }
            Err(e.into())
        }
    }
}

/// `GET /status/{user_id}`
pub async fn status(State(state): State<AppState>, Path(user_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let user_id = UserId::parse(&user_id)?;
    let state = state.registry.state(&user_id).ok_or(ApiError::NotRunning)?;
    Ok(Json(json!({ "user_id": user_id, "state": state })))
}

/// `GET /logs/{user_id}`: persisted warn+ records for one user, newest
/// first. Accepts `level`, `target`, `since` and `limit` query parameters.
pub async fn logs(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(mut query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = UserId::parse(&user_id)?;
    let sink = state.logs.clone().ok_or(ApiError::LogsDisabled)?;
    query.user_id = Some(user_id.to_string());

    let records = tokio::task::spawn_blocking(move || sink.query(&query))
        .await
        .map_err(|e| {
            error!(error = %e, "log query task failed");
            ApiError::LogQueryFailed
        })?
        .map_err(|e| {
            error!(user_id = %user_id, error = %e, "log query failed");
            ApiError::LogQueryFailed
        })?;
    Ok(Json(json!({ "user_id": user_id, "logs": records })))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "healthy", "sessions": state.registry.len() }))
}
