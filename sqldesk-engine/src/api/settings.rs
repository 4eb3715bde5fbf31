//! Settings pass-through endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

use super::error_response;
use crate::engine::Engine;

/// Handler for GET /api/settings/{key}; responds with `null` when unset
pub async fn get_settings_handler(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
) -> Response {
    match engine.get_settings(&key).await {
        Ok(value) => (StatusCode::OK, Json(value.unwrap_or(serde_json::Value::Null))).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Handler for PUT /api/settings/{key}
pub async fn save_settings_handler(
    State(engine): State<Arc<Engine>>,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    match engine.save_settings(&key, value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error),
    }
}
