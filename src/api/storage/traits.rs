//! Storage trait definitions for the API storage backends.

use super::StorageError;
use crate::models::{
    Blueprint, BlueprintRef, Connection, Pipeline, Project, Scope, ScopeKey, TransformationRule,
};
use std::collections::HashMap;

/// Result of a guarded delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deletion<T> {
    Deleted,
    NotFound,
    /// Dependents that block the delete.
    InUse(T),
}

/// Rows still referencing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionDependents {
    pub scopes: u64,
    pub rules: u64,
}

/// Storage backend trait for database operations.
///
/// Every method that writes more than one row commits atomically.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert a connection; the returned copy carries the assigned id.
    async fn create_connection(&self, connection: Connection) -> Result<Connection, StorageError>;

    async fn get_connection(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Option<Connection>, StorageError>;

    /// Connections of a plugin, in creation order.
    async fn list_connections(&self, plugin: &str) -> Result<Vec<Connection>, StorageError>;

    async fn update_connection(&self, connection: &Connection) -> Result<(), StorageError>;

    /// Delete a connection only when no scope or rule references it.
    async fn delete_connection(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Deletion<ConnectionDependents>, StorageError>;

    async fn create_rule(
        &self,
        rule: TransformationRule,
    ) -> Result<TransformationRule, StorageError>;

    async fn get_rule(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> Result<Option<TransformationRule>, StorageError>;

    async fn list_rules(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<Vec<TransformationRule>, StorageError>;

    async fn update_rule(&self, rule: &TransformationRule) -> Result<(), StorageError>;

    /// Delete a rule only when no scope references it; `InUse` lists the scope ids.
    async fn delete_rule(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> Result<Deletion<Vec<String>>, StorageError>;

    async fn get_scope(&self, key: &ScopeKey) -> Result<Option<Scope>, StorageError>;

    /// Scopes of a connection, in import order.
    async fn list_scopes(&self, plugin: &str, connection_id: i64)
    -> Result<Vec<Scope>, StorageError>;

    /// Insert or replace scopes by natural key, all or nothing.
    async fn upsert_scopes(&self, scopes: &[Scope]) -> Result<(), StorageError>;

    /// Blueprints bound to each scope of a connection, from the scope index.
    async fn scope_blueprint_refs(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> Result<HashMap<String, Vec<BlueprintRef>>, StorageError>;

    async fn blueprints_referencing(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<BlueprintRef>, StorageError>;

    /// Reconcile and delete a scope in one transaction.
    ///
    /// Without `delete_data_only`, every blueprint bound to the scope is
    /// detached from it (and disabled if left with no scopes), the index rows
    /// are removed and the scope row is deleted. With `delete_data_only` the
    /// bindings and the scope row stay. Returns the referencing blueprint ids.
    async fn delete_scope_cascade(
        &self,
        key: &ScopeKey,
        delete_data_only: bool,
    ) -> Result<Vec<i64>, StorageError>;

    async fn create_project(&self, project: Project) -> Result<Project, StorageError>;

    async fn get_project(&self, name: &str) -> Result<Option<Project>, StorageError>;

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError>;

    /// Insert a blueprint together with its scope index rows.
    async fn create_blueprint(&self, blueprint: Blueprint) -> Result<Blueprint, StorageError>;

    async fn get_blueprint(&self, blueprint_id: i64) -> Result<Option<Blueprint>, StorageError>;

    async fn get_blueprint_by_project(
        &self,
        project_name: &str,
    ) -> Result<Option<Blueprint>, StorageError>;

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, StorageError>;

    /// Replace a blueprint and rewrite its scope index rows.
    async fn update_blueprint(&self, blueprint: &Blueprint) -> Result<(), StorageError>;

    async fn delete_blueprint(&self, blueprint_id: i64) -> Result<bool, StorageError>;

    async fn create_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline, StorageError>;

    async fn get_pipeline(&self, pipeline_id: i64) -> Result<Option<Pipeline>, StorageError>;

    async fn list_pipelines(
        &self,
        blueprint_id: Option<i64>,
    ) -> Result<Vec<Pipeline>, StorageError>;

    /// Persist progress; refuses to overwrite a pipeline that already ended.
    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<(), StorageError>;
}
