//! Session endpoints: binding, query execution, cancellation, the safety
//! check and completions

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;

use super::error_response;
use crate::engine::Engine;
use crate::session::SessionId;
use crate::Error;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    /// Connection name, or `null` to detach
    pub connection: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRequest {
    pub sql: String,
}

#[derive(Debug, Deserialize)]
pub struct CompletionParams {
    #[serde(default)]
    pub prefix: String,
}

/// Handler for PUT /api/sessions/{id}
pub async fn bind_session_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(request): Json<BindRequest>,
) -> Response {
    let session = SessionId::new(id);
    match engine
        .bind_session(&session, request.connection.as_deref())
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "session": session, "connection": request.connection })),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

/// Handler for POST /api/sessions/{id}/query
///
/// Request body:
/// ```json
/// { "sql": "SELECT * FROM users", "offset": 1000 }
/// ```
///
/// Responds with a [`crate::QueryResult`] page. A cancelled or superseded
/// query is not an error and responds with `{ "cancelled": true }`.
pub async fn execute_query_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let session = SessionId::new(id);
    match engine.execute(&session, &request.sql, request.offset).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(Error::Cancelled) => {
            (StatusCode::OK, Json(serde_json::json!({ "cancelled": true }))).into_response()
        }
        Err(error) => error_response(&error),
    }
}

/// Handler for POST /api/sessions/{id}/cancel
pub async fn cancel_handler(State(engine): State<Arc<Engine>>, Path(id): Path<String>) -> Response {
    let cancelled = engine.cancel(&SessionId::new(id));
    (StatusCode::OK, Json(serde_json::json!({ "cancelled": cancelled }))).into_response()
}

/// Handler for POST /api/sessions/{id}/safety
pub async fn check_safety_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(request): Json<SafetyRequest>,
) -> Response {
    let check = engine.check_safety(&SessionId::new(id), &request.sql).await;
    (StatusCode::OK, Json(check)).into_response()
}

/// Handler for GET /api/sessions/{id}/completions?prefix=
pub async fn completions_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(params): Query<CompletionParams>,
) -> Response {
    let candidates = engine.completions(&SessionId::new(id), &params.prefix).await;
    (StatusCode::OK, Json(candidates)).into_response()
}
