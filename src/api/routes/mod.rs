//! API routes module - organizes all route handlers.
//!
//! Plugin-scoped resources live under /plugins/{plugin}/connections/{connection_id}/;
//! projects, blueprints and pipelines are top-level.

pub mod app_state;
pub mod blueprints;
pub mod connections;
pub mod error;
pub mod pipelines;
pub mod projects;
pub mod remote_scopes;
pub mod scopes;
pub mod transformation_rules;

use axum::{Router, middleware::from_fn_with_state, response::Json, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use app_state::AppState;
pub use error::{ApiError, ApiResult};

use crate::config::AppConfig;
use crate::middleware::{create_cors_layer, rate_limit_middleware};
use crate::plugins::{FakePlugin, HttpRemotePlugin, PluginError, PluginRegistry};
use crate::storage::{
    PostgresStorageBackend, SqliteStorageBackend, StorageBackend, StorageError,
};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Create the main API router combining all route modules
///
/// Note: State is applied by callers (`create_app`, or `.with_state` in tests).
pub fn create_api_router(app_state: AppState) -> Router<AppState> {
    Router::new()
        .merge(connections::connections_router())
        .merge(remote_scopes::remote_scopes_router())
        .merge(scopes::scopes_router())
        .merge(transformation_rules::transformation_rules_router())
        .merge(projects::projects_router())
        .merge(blueprints::blueprints_router())
        .merge(pipelines::pipelines_router())
        .route_layer(from_fn_with_state(
            app_state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
}

/// The full application: health check, the API under /api/v1, tracing and CORS.
pub fn create_app(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/health", get(health_check))
        .nest("/api/v1", create_api_router(app_state.clone()))
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer()),
        )
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "pipeline-control-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Register the built-in fake plugin plus the configured remote plugins.
pub fn create_plugin_registry(config: &AppConfig) -> Result<PluginRegistry, PluginError> {
    let mut plugins = PluginRegistry::new().with(Arc::new(FakePlugin::new()));
    for (name, base_url) in &config.remote_plugins {
        plugins.register(Arc::new(HttpRemotePlugin::new(name.clone(), base_url)?));
        info!("Registered remote plugin {} at {}", name, base_url);
    }
    Ok(plugins)
}

/// Create the application state with storage initialization.
///
/// Uses PostgreSQL when `database_url` is configured, SQLite otherwise.
pub async fn create_app_state_with_storage(config: &AppConfig) -> Result<AppState, StartupError> {
    let storage: Arc<dyn StorageBackend> = match &config.database_url {
        Some(url) => {
            info!("Using PostgreSQL storage");
            Arc::new(PostgresStorageBackend::connect(url, config.database_max_connections).await?)
        }
        None => match &config.sqlite_path {
            Some(path) => {
                info!("Using SQLite storage at {}", path.display());
                Arc::new(SqliteStorageBackend::open(path)?)
            }
            None => {
                info!("Using in-memory SQLite storage");
                Arc::new(SqliteStorageBackend::in_memory()?)
            }
        },
    };
    let plugins = create_plugin_registry(config)?;
    Ok(AppState::new(storage, plugins, config))
}
