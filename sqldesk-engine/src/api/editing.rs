//! Transaction control and in-grid editing

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;

use super::error_response;
use crate::engine::Engine;
use crate::schema::CellUpdate;
use crate::session::SessionId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableRequest {
    pub sql: String,
}

fn transaction_state(engine: &Engine, session: &SessionId) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "inTransaction": engine.in_transaction(session) })),
    )
        .into_response()
}

/// Handler for GET /api/sessions/{id}/transaction
pub async fn transaction_state_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Response {
    transaction_state(&engine, &SessionId::new(id))
}

/// Handler for POST /api/sessions/{id}/transaction/{action}
///
/// `action` is `begin`, `commit` or `rollback`. Responds with the
/// transaction state afterwards.
pub async fn transaction_handler(
    State(engine): State<Arc<Engine>>,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    let session = SessionId::new(id);
    let result = match action.as_str() {
        "begin" => engine.begin_transaction(&session).await,
        "commit" => engine.commit(&session).await,
        "rollback" => engine.rollback(&session).await,
        other => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": format!("unknown transaction action '{other}'"),
                })),
            )
                .into_response()
        }
    };

    match result {
        Ok(()) => transaction_state(&engine, &session),
        Err(error) => error_response(&error),
    }
}

/// Handler for POST /api/sessions/{id}/editable
pub async fn check_editable_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(request): Json<EditableRequest>,
) -> Response {
    match engine.check_editable(&SessionId::new(id), &request.sql).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Handler for POST /api/sessions/{id}/cells
///
/// Request body:
/// ```json
/// { "schema": "main", "table": "users", "column": "name", "value": "ann",
///   "primaryKey": [{ "column": "id", "value": "1" }] }
/// ```
pub async fn update_cell_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Json(update): Json<CellUpdate>,
) -> Response {
    match engine.update_cell(&SessionId::new(id), &update).await {
        Ok(affected) => {
            (StatusCode::OK, Json(serde_json::json!({ "affectedRows": affected }))).into_response()
        }
        Err(error) => error_response(&error),
    }
}
