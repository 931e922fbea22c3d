//! Error taxonomy of the control-plane services.

use crate::plugins::PluginError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Connection, scope, rule, group, blueprint, project or pipeline unresolved
    #[error("{entity_type} not found: {entity_id}")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },
    #[error("remote discovery failed for connection {connection_id}: {source}")]
    DiscoveryFailed {
        connection_id: i64,
        #[source]
        source: PluginError,
    },
    #[error("plugin {plugin} failed: {source}")]
    PluginFailed {
        plugin: String,
        #[source]
        source: PluginError,
    },
    /// A blueprint binds a scope the registry no longer holds
    #[error(
        "cannot compile blueprint {blueprint}: scope {scope_id} not found on {plugin} connection {connection_id}"
    )]
    ScopeNotFound {
        blueprint: String,
        plugin: String,
        connection_id: i64,
        scope_id: String,
    },
    #[error("transformation rule {rule_id} is still used by scopes {}", scope_ids.join(", "))]
    RuleInUse { rule_id: i64, scope_ids: Vec<String> },
    #[error("connection {connection_id} still has {scopes} scopes and {rules} transformation rules")]
    ConnectionInUse {
        connection_id: i64,
        scopes: u64,
        rules: u64,
    },
    #[error("scope {scope_id} is referenced by blueprints {blueprint_ids:?}")]
    ScopeInUse {
        scope_id: String,
        blueprint_ids: Vec<i64>,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// The task driving a pipeline ended without reporting back
    #[error("pipeline {pipeline_id} execution aborted: {reason}")]
    ExecutionAborted { pipeline_id: i64, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ServiceError {
    pub fn not_found(entity_type: &str, entity_id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::ValidationFailed(message.into())
    }

    /// Stable taxonomy name used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound { .. } => "NotFound",
            ServiceError::DiscoveryFailed { .. } => "DiscoveryFailed",
            ServiceError::PluginFailed { .. } => "PluginFailed",
            ServiceError::ScopeNotFound { .. } => "ScopeNotFound",
            ServiceError::RuleInUse { .. } => "RuleInUse",
            ServiceError::ConnectionInUse { .. } => "ConnectionInUse",
            ServiceError::ScopeInUse { .. } => "ScopeInUse",
            ServiceError::ValidationFailed(_) => "ValidationFailed",
            ServiceError::ExecutionAborted { .. } => "ExecutionAborted",
            ServiceError::Storage(StorageError::NotFound { .. }) => "NotFound",
            ServiceError::Storage(StorageError::Conflict { .. }) => "Conflict",
            ServiceError::Storage(_) => "StorageError",
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
