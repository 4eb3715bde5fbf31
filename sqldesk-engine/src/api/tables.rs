//! Schema tree endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

use super::error_response;
use crate::engine::Engine;
use crate::session::SessionId;

/// Handler for GET /api/sessions/{id}/schemas
pub async fn list_schemas_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Response {
    match engine.list_schemas(&SessionId::new(id)).await {
        Ok(schemas) => (StatusCode::OK, Json(schemas)).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Handler for GET /api/sessions/{id}/schemas/{schema}/tables
pub async fn list_tables_handler(
    State(engine): State<Arc<Engine>>,
    Path((id, schema)): Path<(String, String)>,
) -> Response {
    match engine.list_tables(&SessionId::new(id), &schema).await {
        Ok(tables) => (StatusCode::OK, Json(tables)).into_response(),
        Err(error) => {
            tracing::warn!(%schema, %error, "Failed to list tables");
            error_response(&error)
        }
    }
}

/// Handler for GET /api/sessions/{id}/schemas/{schema}/tables/{table}/columns
pub async fn list_columns_handler(
    State(engine): State<Arc<Engine>>,
    Path((id, schema, table)): Path<(String, String, String)>,
) -> Response {
    match engine.list_columns(&SessionId::new(id), &schema, &table).await {
        Ok(columns) => (StatusCode::OK, Json(columns)).into_response(),
        Err(error) => {
            tracing::warn!(%schema, %table, %error, "Failed to list columns");
            error_response(&error)
        }
    }
}

/// Handler for GET /api/sessions/{id}/schemas/{schema}/tables/{table}
///
/// Returns columns, indexes and foreign keys of one table or view.
pub async fn describe_table_handler(
    State(engine): State<Arc<Engine>>,
    Path((id, schema, table)): Path<(String, String, String)>,
) -> Response {
    match engine.describe_table(&SessionId::new(id), &schema, &table).await {
        Ok(structure) => (StatusCode::OK, Json(structure)).into_response(),
        Err(error) => {
            tracing::warn!(%schema, %table, %error, "Failed to describe table");
            error_response(&error)
        }
    }
}
