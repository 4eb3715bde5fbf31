//! Connection profile and lifecycle endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;

use super::error_response;
use crate::engine::Engine;
use crate::profile::{ConnectionProfile, ConnectionSecrets};

/// Body of `PUT /api/connections` and `POST /api/connections/test`
///
/// ```json
/// {
///   "profile": { "name": "local", "type": "sqlite", "path": "/data/app.db" },
///   "secrets": { "password": "..." }
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub profile: ConnectionProfile,
    #[serde(default)]
    pub secrets: Option<ConnectionSecrets>,
}

/// Handler for GET /api/connections
pub async fn list_profiles_handler(State(engine): State<Arc<Engine>>) -> Response {
    match engine.list_profiles().await {
        Ok(profiles) => (StatusCode::OK, Json(profiles)).into_response(),
        Err(error) => {
            tracing::warn!(%error, "Failed to list profiles");
            error_response(&error)
        }
    }
}

/// Handler for PUT /api/connections
pub async fn save_profile_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ProfileRequest>,
) -> Response {
    let name = request.profile.name.clone();
    match engine.save_profile(request.profile, request.secrets).await {
        Ok(()) => match engine.get_profile(&name).await {
            Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
            Err(error) => error_response(&error),
        },
        Err(error) => error_response(&error),
    }
}

/// Handler for DELETE /api/connections/{name}
///
/// Closes the live connection of the profile and detaches its sessions.
pub async fn delete_profile_handler(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Response {
    match engine.delete_profile(&name).await {
        Ok(deleted) => (StatusCode::OK, Json(serde_json::json!({ "deleted": deleted }))).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Handler for POST /api/connections/test
///
/// Connects and disconnects once; nothing is registered.
pub async fn test_connection_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ProfileRequest>,
) -> Response {
    match engine.test(&request.profile, request.secrets).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Handler for GET /api/open
pub async fn list_open_handler(State(engine): State<Arc<Engine>>) -> Response {
    (StatusCode::OK, Json(engine.list_open())).into_response()
}

/// Handler for POST /api/open/{name}
pub async fn open_handler(State(engine): State<Arc<Engine>>, Path(name): Path<String>) -> Response {
    match engine.open(&name).await {
        Ok(open) => (StatusCode::OK, Json(open)).into_response(),
        Err(error) => {
            tracing::warn!(profile = %name, %error, "Failed to open connection");
            error_response(&error)
        }
    }
}

/// Handler for DELETE /api/open/{name}
pub async fn close_handler(State(engine): State<Arc<Engine>>, Path(name): Path<String>) -> Response {
    let closed = engine.close(&name).await;
    (StatusCode::OK, Json(serde_json::json!({ "closed": closed }))).into_response()
}
