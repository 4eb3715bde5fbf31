//! REST API endpoints
//!
//! Thin JSON handlers over [`Engine`]. Every handler takes the engine from
//! router state and maps [`Error`] to a status code plus `{ error, kind }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::engine::Engine;
use crate::Error;

pub mod connections;
pub mod editing;
pub mod query;
pub mod settings;
pub mod tables;

/// Create the API router with all endpoints
///
/// # Arguments
///
/// * `engine` - Shared engine handed to every handler
///
/// # Returns
///
/// An Axum Router configured with all API routes
pub fn create_api_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route(
            "/connections",
            get(connections::list_profiles_handler).put(connections::save_profile_handler),
        )
        .route("/connections/test", post(connections::test_connection_handler))
        .route("/connections/{name}", axum::routing::delete(connections::delete_profile_handler))
        .route("/open", get(connections::list_open_handler))
        .route(
            "/open/{name}",
            post(connections::open_handler).delete(connections::close_handler),
        )
        .route("/sessions/{id}", put(query::bind_session_handler))
        .route("/sessions/{id}/query", post(query::execute_query_handler))
        .route("/sessions/{id}/cancel", post(query::cancel_handler))
        .route("/sessions/{id}/safety", post(query::check_safety_handler))
        .route("/sessions/{id}/completions", get(query::completions_handler))
        .route("/sessions/{id}/transaction", get(editing::transaction_state_handler))
        .route(
            "/sessions/{id}/transaction/{action}",
            post(editing::transaction_handler),
        )
        .route("/sessions/{id}/editable", post(editing::check_editable_handler))
        .route("/sessions/{id}/cells", post(editing::update_cell_handler))
        .route("/sessions/{id}/schemas", get(tables::list_schemas_handler))
        .route(
            "/sessions/{id}/schemas/{schema}/tables",
            get(tables::list_tables_handler),
        )
        .route(
            "/sessions/{id}/schemas/{schema}/tables/{table}",
            get(tables::describe_table_handler),
        )
        .route(
            "/sessions/{id}/schemas/{schema}/tables/{table}/columns",
            get(tables::list_columns_handler),
        )
        .route(
            "/settings/{key}",
            get(settings::get_settings_handler).put(settings::save_settings_handler),
        )
        .with_state(engine)
}

/// Status code for an engine error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::ProfileNotFound(_) => StatusCode::NOT_FOUND,
        Error::NotConnected(_) | Error::Transaction(_) => StatusCode::CONFLICT,
        Error::ConnectFailed { .. } | Error::TunnelUnreachable { .. } => StatusCode::BAD_GATEWAY,
        Error::TunnelAuthFailed { .. } | Error::KeyDecryptFailed { .. } => StatusCode::UNAUTHORIZED,
        Error::IntrospectionFailed { .. } | Error::NotEditable(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::SyntaxOrRuntimeError { .. }
        | Error::InvalidIdentifier(_)
        | Error::InvalidProfile(_)
        | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::Cancelled => StatusCode::OK,
    }
}

/// JSON body for a failed request
pub fn error_response(error: &Error) -> Response {
    (
        status_for(error),
        Json(serde_json::json!({
            "error": error.to_string(),
            "kind": error.kind(),
        })),
    )
        .into_response()
}
