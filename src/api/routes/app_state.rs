//! Application state management.
//!
//! Defines the AppState struct that holds the storage backend, the plugin
//! registry and the control-plane services built over them.

use crate::config::AppConfig;
use crate::middleware::rate_limit::{RateLimiterState, create_rate_limiter};
use crate::plugins::{FakePlugin, PluginRegistry};
use crate::services::{
    BlueprintService, ConnectionLocks, ConnectionService, LocalTaskEngine, PipelineOrchestrator,
    ProjectService, RemoteScopeService, ScopeService, TaskEngine, TransformationRuleService,
};
use crate::storage::{SqliteStorageBackend, StorageBackend, StorageError};
use axum::extract::FromRef;
use std::sync::Arc;

/// Application state shared across all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageBackend>,
    pub plugins: Arc<PluginRegistry>,
    pub connections: Arc<ConnectionService>,
    pub remote_scopes: Arc<RemoteScopeService>,
    pub scopes: Arc<ScopeService>,
    pub rules: Arc<TransformationRuleService>,
    pub projects: Arc<ProjectService>,
    pub blueprints: Arc<BlueprintService>,
    pub pipelines: Arc<PipelineOrchestrator>,
    pub rate_limiter: RateLimiterState,
}

impl AppState {
    /// Wire the services with the local task engine.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        plugins: PluginRegistry,
        config: &AppConfig,
    ) -> Self {
        let plugins = Arc::new(plugins);
        let engine = Arc::new(LocalTaskEngine::new(storage.clone(), plugins.clone()));
        Self::with_engine(storage, plugins, engine, config)
    }

    pub fn with_engine(
        storage: Arc<dyn StorageBackend>,
        plugins: Arc<PluginRegistry>,
        engine: Arc<dyn TaskEngine>,
        config: &AppConfig,
    ) -> Self {
        let locks = Arc::new(ConnectionLocks::new());
        let scopes = Arc::new(ScopeService::new(
            storage.clone(),
            plugins.clone(),
            locks.clone(),
        ));
        let pipelines = Arc::new(PipelineOrchestrator::new(storage.clone(), engine));
        Self {
            connections: Arc::new(ConnectionService::new(storage.clone(), plugins.clone())),
            remote_scopes: Arc::new(RemoteScopeService::new(
                storage.clone(),
                plugins.clone(),
                scopes.clone(),
                config.discovery(),
            )),
            rules: Arc::new(TransformationRuleService::new(
                storage.clone(),
                plugins.clone(),
            )),
            projects: Arc::new(ProjectService::new(storage.clone())),
            blueprints: Arc::new(BlueprintService::new(
                storage.clone(),
                locks,
                pipelines.clone(),
            )),
            scopes,
            pipelines,
            rate_limiter: create_rate_limiter(config.rate_limit_per_minute),
            storage,
            plugins,
        }
    }

    /// In-memory SQLite with the built-in fake plugin, for tests and demos.
    pub fn in_memory() -> Result<Self, StorageError> {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorageBackend::in_memory()?);
        let plugins = PluginRegistry::new().with(Arc::new(FakePlugin::new()));
        Ok(Self::new(storage, plugins, &AppConfig::default()))
    }
}

impl FromRef<AppState> for RateLimiterState {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.rate_limiter.clone()
    }
}
