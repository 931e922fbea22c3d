//! Capability interfaces a data-source plugin implements.
//!
//! The core never inspects plugin payloads; it only stores and forwards them.

use super::PluginError;
use crate::models::{
    Connection, DomainEntity, PipelineTask, RemoteScopePage, RulePayload, Scope, ScopeInput,
    TaskFailure, TransformationRule,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Lists one page of the remote hierarchy below `group_id` (the root when `None`).
#[async_trait]
pub trait RemoteScopeLister: Send + Sync {
    async fn list_groups(
        &self,
        connection: &Connection,
        group_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<RemoteScopePage, PluginError>;
}

/// Converts raw plugin entries into the shapes the registries store.
pub trait ScopeConvertible: Send + Sync {
    fn convert_scope(&self, _connection: &Connection, raw: Value) -> Result<ScopeInput, PluginError> {
        ScopeInput::from_value(raw).map_err(PluginError::InvalidPayload)
    }

    fn convert_rule(&self, raw: Value) -> Result<RulePayload, PluginError> {
        RulePayload::from_value(raw).map_err(PluginError::InvalidPayload)
    }
}

/// Everything a task needs, rehydrated from storage at execution time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task: PipelineTask,
    pub connection: Option<Connection>,
    pub scope: Option<Scope>,
    pub transformation_rule: Option<TransformationRule>,
    pub entities: Vec<DomainEntity>,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, context: TaskContext) -> Result<(), TaskFailure>;
}

/// A data-source plugin: every capability plus a registry name.
#[async_trait]
pub trait Plugin: RemoteScopeLister + ScopeConvertible + TaskExecutor {
    fn name(&self) -> &str;

    /// Remove collected data of a scope. Plugins that keep none use the default.
    async fn purge_scope_data(
        &self,
        _connection: &Connection,
        _scope: &Scope,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
