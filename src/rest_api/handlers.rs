//! HTTP handlers for the REST API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, instrument};

use super::dto::{DatabaseListResponse, DatabaseSummary, ErrorResponse, HealthResponse};
use super::server::ApiState;
use crate::store::ObjectKey;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal(kind: &str, e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(kind, &e.to_string())),
    )
}

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth: state.queue.len(),
        in_flight: state.queue.in_flight(),
    })
}

/// List all Databases in scope
#[instrument(skip(state))]
pub async fn list_databases(
    State(state): State<ApiState>,
) -> Result<Json<DatabaseListResponse>, ApiError> {
    let keys = state.store.list().await.map_err(|e| {
        error!("Failed to list databases: {}", e);
        internal("list_failed", e)
    })?;

    let mut items = Vec::with_capacity(keys.len());
    for key in keys {
        match state.store.get(&key).await {
            Ok(Some(db)) => items.push(DatabaseSummary::from(&db)),
            Ok(None) => {}
            Err(e) => return Err(internal("get_failed", e)),
        }
    }
    let total = items.len();
    Ok(Json(DatabaseListResponse { items, total }))
}

/// Get a specific Database
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_database(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DatabaseSummary>, ApiError> {
    let key = ObjectKey::new(namespace, name);
    match state.store.get(&key).await {
        Ok(Some(db)) => Ok(Json(DatabaseSummary::from(&db))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Database {key} not found"),
            )),
        )),
        Err(e) => {
            error!("Failed to get database {}: {}", key, e);
            Err(internal("get_failed", e))
        }
    }
}
