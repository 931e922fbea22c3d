//! Scope registry and the scope deletion coordinator.

use super::error::{ServiceError, ServiceResult};
use super::locks::ConnectionLocks;
use crate::models::{Connection, Scope, ScopeInput, ScopeKey, ScopePatch, ScopeResponse};
use crate::plugins::{PluginError, PluginRegistry};
use crate::storage::StorageBackend;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// How a scope delete treats blueprints that still bind the scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct DeleteScopeOptions {
    /// Purge collected data only; the scope record and its bindings stay.
    #[serde(default)]
    pub delete_data_only: bool,
    /// Refuse a full delete of a referenced scope instead of detaching it.
    #[serde(default)]
    pub block_if_referenced: bool,
}

/// Reconciles blueprints with a scope before the scope goes away.
pub struct ScopeDeletionCoordinator {
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
    locks: Arc<ConnectionLocks>,
}

impl ScopeDeletionCoordinator {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        plugins: Arc<PluginRegistry>,
        locks: Arc<ConnectionLocks>,
    ) -> Self {
        Self {
            storage,
            plugins,
            locks,
        }
    }

    /// Delete a scope, returning the ids of the blueprints that referenced it.
    ///
    /// Holds the connection lock for both phases, so a concurrent compile of
    /// any blueprint on this connection sees the scope either whole or gone.
    pub async fn delete_scope(
        &self,
        key: &ScopeKey,
        options: DeleteScopeOptions,
    ) -> ServiceResult<Vec<i64>> {
        let _guard = self.locks.lock(&key.plugin, key.connection_id).await;
        let connection = self
            .storage
            .get_connection(&key.plugin, key.connection_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("connection", key.connection_id))?;
        let scope = self
            .storage
            .get_scope(key)
            .await?
            .ok_or_else(|| ServiceError::not_found("scope", key))?;

        let referencing = self.storage.blueprints_referencing(key).await?;
        if options.block_if_referenced && !options.delete_data_only && !referencing.is_empty() {
            return Err(ServiceError::ScopeInUse {
                scope_id: key.scope_id.clone(),
                blueprint_ids: referencing.iter().map(|b| b.id).collect(),
            });
        }

        let plugin = self
            .plugins
            .get(&key.plugin)
            .ok_or_else(|| ServiceError::not_found("plugin", &key.plugin))?;
        plugin
            .purge_scope_data(&connection, &scope)
            .await
            .map_err(|source| ServiceError::PluginFailed {
                plugin: key.plugin.clone(),
                source,
            })?;

        let affected = self
            .storage
            .delete_scope_cascade(key, options.delete_data_only)
            .await?;
        if options.delete_data_only {
            info!("Purged data of scope {}, bindings kept", key);
        } else {
            info!(
                "Deleted scope {}, detached from blueprints {:?}",
                key, affected
            );
        }
        Ok(affected)
    }
}

pub struct ScopeService {
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
    locks: Arc<ConnectionLocks>,
    coordinator: ScopeDeletionCoordinator,
}

impl ScopeService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        plugins: Arc<PluginRegistry>,
        locks: Arc<ConnectionLocks>,
    ) -> Self {
        let coordinator =
            ScopeDeletionCoordinator::new(storage.clone(), plugins.clone(), locks.clone());
        Self {
            storage,
            plugins,
            locks,
            coordinator,
        }
    }

    async fn connection(&self, plugin: &str, connection_id: i64) -> ServiceResult<Connection> {
        self.storage
            .get_connection(plugin, connection_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("connection", connection_id))
    }

    pub async fn get(
        &self,
        plugin: &str,
        connection_id: i64,
        scope_id: &str,
    ) -> ServiceResult<ScopeResponse> {
        let key = ScopeKey::new(plugin, connection_id, scope_id);
        let scope = self
            .storage
            .get_scope(&key)
            .await?
            .ok_or_else(|| ServiceError::not_found("scope", &key))?;
        let transformation_rule_name = match scope.transformation_rule_id {
            Some(rule_id) => self
                .storage
                .get_rule(plugin, connection_id, rule_id)
                .await?
                .map(|r| r.name),
            None => None,
        };
        let blueprints = self.storage.blueprints_referencing(&key).await?;
        Ok(ScopeResponse {
            scope,
            transformation_rule_name,
            blueprints: Some(blueprints),
        })
    }

    /// Scopes of a connection in import order, optionally with the
    /// blueprints bound to each.
    pub async fn list(
        &self,
        plugin: &str,
        connection_id: i64,
        include_blueprints: bool,
    ) -> ServiceResult<Vec<ScopeResponse>> {
        self.connection(plugin, connection_id).await?;
        let scopes = self.storage.list_scopes(plugin, connection_id).await?;
        let rule_names: HashMap<i64, String> = self
            .storage
            .list_rules(plugin, connection_id)
            .await?
            .into_iter()
            .map(|r| (r.id, r.name))
            .collect();
        let mut refs = if include_blueprints {
            self.storage
                .scope_blueprint_refs(plugin, connection_id)
                .await?
        } else {
            HashMap::new()
        };
        Ok(scopes
            .into_iter()
            .map(|scope| {
                let transformation_rule_name = scope
                    .transformation_rule_id
                    .and_then(|id| rule_names.get(&id).cloned());
                let blueprints = include_blueprints
                    .then(|| refs.remove(&scope.id).unwrap_or_default());
                ScopeResponse {
                    scope,
                    transformation_rule_name,
                    blueprints,
                }
            })
            .collect())
    }

    /// Convert raw plugin entries and upsert them.
    pub async fn upsert_raw(
        &self,
        plugin: &str,
        connection_id: i64,
        raw: Vec<Value>,
    ) -> ServiceResult<Vec<Scope>> {
        let converter = self
            .plugins
            .get(plugin)
            .ok_or_else(|| ServiceError::not_found("plugin", plugin))?;
        let connection = self.connection(plugin, connection_id).await?;
        let inputs = raw
            .into_iter()
            .map(|entry| converter.convert_scope(&connection, entry))
            .collect::<Result<Vec<_>, PluginError>>()
            .map_err(|e| ServiceError::validation(e.to_string()))?;
        self.upsert(plugin, connection_id, inputs).await
    }

    /// Insert or update scopes by natural key, all or nothing.
    ///
    /// Absent rule references keep what is stored; identical input leaves the
    /// stored record untouched.
    pub async fn upsert(
        &self,
        plugin: &str,
        connection_id: i64,
        inputs: Vec<ScopeInput>,
    ) -> ServiceResult<Vec<Scope>> {
        let mut seen = HashSet::new();
        for input in &inputs {
            input.validate().map_err(ServiceError::ValidationFailed)?;
            if !seen.insert(input.id.clone()) {
                return Err(ServiceError::validation(format!(
                    "scope {} appears twice in one request",
                    input.id
                )));
            }
        }

        let _guard = self.locks.lock(plugin, connection_id).await;
        self.connection(plugin, connection_id).await?;
        let now = Utc::now();
        let mut merged = Vec::with_capacity(inputs.len());
        for input in inputs {
            let input = input.normalized();
            if let Some(Some(rule_id)) = input.transformation_rule_id {
                self.storage
                    .get_rule(plugin, connection_id, rule_id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("transformation_rule", rule_id))?;
            }
            let key = ScopeKey::new(plugin, connection_id, input.id.clone());
            let existing = self.storage.get_scope(&key).await?;
            merged.push(Scope::merge_input(
                existing.as_ref(),
                plugin,
                connection_id,
                input,
                now,
            ));
        }
        self.storage.upsert_scopes(&merged).await?;
        debug!(
            "Upserted {} scopes for {} connection {}",
            merged.len(),
            plugin,
            connection_id
        );
        Ok(merged)
    }

    pub async fn patch(
        &self,
        plugin: &str,
        connection_id: i64,
        scope_id: &str,
        patch: ScopePatch,
    ) -> ServiceResult<Scope> {
        let key = ScopeKey::new(plugin, connection_id, scope_id);
        let _guard = self.locks.lock(plugin, connection_id).await;
        let mut scope = self
            .storage
            .get_scope(&key)
            .await?
            .ok_or_else(|| ServiceError::not_found("scope", &key))?;
        if let Some(Some(rule_id)) = patch.transformation_rule_id {
            self.storage
                .get_rule(plugin, connection_id, rule_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("transformation_rule", rule_id))?;
        }
        if matches!(patch.name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(ServiceError::validation("scope name must not be empty"));
        }
        scope.apply_patch(patch, Utc::now());
        self.storage.upsert_scopes(std::slice::from_ref(&scope)).await?;
        info!("Updated scope {}", key);
        Ok(scope)
    }

    pub async fn delete(
        &self,
        plugin: &str,
        connection_id: i64,
        scope_id: &str,
        options: DeleteScopeOptions,
    ) -> ServiceResult<Vec<i64>> {
        let key = ScopeKey::new(plugin, connection_id, scope_id);
        self.coordinator.delete_scope(&key, options).await
    }
}
