//! EngineLayer - Axum integration layer
//!
//! Mounts the engine's JSON API into an Axum application.

use crate::api::create_api_router;
use crate::engine::Engine;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Main layer for serving an [`Engine`] over HTTP
///
/// # Example
///
/// ```rust,no_run
/// use axum::Router;
/// use sqldesk_engine::{Engine, EngineConfig, EngineLayer};
/// use std::sync::Arc;
///
/// let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
/// let app: Router = Router::new().merge(EngineLayer::new("/sqldesk", engine).into_router());
/// ```
pub struct EngineLayer {
    base_path: String,
    engine: Arc<Engine>,
}

impl EngineLayer {
    /// Create a layer at the given base path
    ///
    /// # Arguments
    ///
    /// * `base_path` - The URL path where the API will be mounted (e.g., "/sqldesk")
    /// * `engine` - The engine shared with the rest of the application
    pub fn new(base_path: impl Into<String>, engine: Arc<Engine>) -> Self {
        Self {
            base_path: base_path.into().trim_end_matches('/').to_string(),
            engine,
        }
    }

    /// Convert into an Axum Router that can be merged
    ///
    /// The returned router serves the API at `{base_path}/api/*` with
    /// permissive CORS for development.
    pub fn into_router(self) -> Router {
        Router::new()
            .nest(&format!("{}/api", self.base_path), create_api_router(self.engine))
            .layer(CorsLayer::permissive())
    }
}
