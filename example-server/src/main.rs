use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use sqldesk_engine::{ConnectionProfile, Engine, EngineConfig, EngineLayer, OpenConnection};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod database;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqldesk_engine=debug")),
        )
        .init();

    // Use path relative to example-server crate
    let database_path = PathBuf::from("./data/example.db");
    database::seed(&database_path)
        .await
        .expect("Failed to seed the demo database");

    let engine = Arc::new(Engine::in_memory(EngineConfig::default()));
    engine
        .save_profile(ConnectionProfile::sqlite("demo", &database_path), None)
        .await
        .expect("Failed to save the demo profile");
    engine
        .save_profile(
            ConnectionProfile::sqlite("demo-prod", &database_path).with_tags(["prod"]),
            None,
        )
        .await
        .expect("Failed to save the production demo profile");

    // EngineLayer returns a stateless Router, merge it after with_state()
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::clone(&engine))
        .merge(EngineLayer::new("/sqldesk", Arc::clone(&engine)).into_router());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .expect("Failed to bind to port 3000");

    tracing::info!("Server running at http://127.0.0.1:3000");
    tracing::info!("Engine API available at http://127.0.0.1:3000/sqldesk/api");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("Server error");

    engine.shutdown().await;
}

async fn root_handler() -> &'static str {
    "Welcome to the sqldesk example server"
}

async fn health_handler(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<OpenConnection>>, StatusCode> {
    // The demo profile must at least be reachable
    let profile = ConnectionProfile::sqlite("demo", "./data/example.db");
    engine
        .test(&profile, None)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(engine.list_open()))
}
