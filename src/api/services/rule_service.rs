//! Transformation rule registry.

use super::error::{ServiceError, ServiceResult};
use crate::models::TransformationRule;
use crate::plugins::PluginRegistry;
use crate::storage::{Deletion, StorageBackend, StorageError};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

pub struct TransformationRuleService {
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
}

impl TransformationRuleService {
    pub fn new(storage: Arc<dyn StorageBackend>, plugins: Arc<PluginRegistry>) -> Self {
        Self { storage, plugins }
    }

    async fn ensure_connection(&self, plugin: &str, connection_id: i64) -> ServiceResult<()> {
        self.storage
            .get_connection(plugin, connection_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| ServiceError::not_found("connection", connection_id))
    }

    pub async fn create(
        &self,
        plugin: &str,
        connection_id: i64,
        raw: Value,
    ) -> ServiceResult<TransformationRule> {
        let converter = self
            .plugins
            .get(plugin)
            .ok_or_else(|| ServiceError::not_found("plugin", plugin))?;
        self.ensure_connection(plugin, connection_id).await?;
        let payload = converter
            .convert_rule(raw)
            .map_err(|e| ServiceError::validation(e.to_string()))?;
        self.ensure_unique_name(plugin, connection_id, &payload.name, None)
            .await?;
        let now = Utc::now();
        let rule = TransformationRule {
            id: 0,
            plugin: plugin.to_string(),
            connection_id,
            name: payload.name,
            payload: payload.fields,
            created_at: now,
            updated_at: now,
        };
        let created = self.storage.create_rule(rule).await.map_err(duplicate_name)?;
        info!(
            "Created transformation rule {} ({}) on {} connection {}",
            created.id, created.name, plugin, connection_id
        );
        Ok(created)
    }

    pub async fn get(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> ServiceResult<TransformationRule> {
        self.storage
            .get_rule(plugin, connection_id, rule_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("transformation_rule", rule_id))
    }

    pub async fn list(
        &self,
        plugin: &str,
        connection_id: i64,
    ) -> ServiceResult<Vec<TransformationRule>> {
        self.ensure_connection(plugin, connection_id).await?;
        Ok(self.storage.list_rules(plugin, connection_id).await?)
    }

    /// Merge supplied top-level fields into the stored payload.
    pub async fn patch(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
        patch: Map<String, Value>,
    ) -> ServiceResult<TransformationRule> {
        let mut rule = self.get(plugin, connection_id, rule_id).await?;
        rule.merge_patch(patch, Utc::now())
            .map_err(ServiceError::ValidationFailed)?;
        self.ensure_unique_name(plugin, connection_id, &rule.name, Some(rule_id))
            .await?;
        self.storage.update_rule(&rule).await.map_err(duplicate_name)?;
        info!("Patched transformation rule {} of {} connection {}", rule_id, plugin, connection_id);
        Ok(rule)
    }

    pub async fn delete(
        &self,
        plugin: &str,
        connection_id: i64,
        rule_id: i64,
    ) -> ServiceResult<TransformationRule> {
        let rule = self.get(plugin, connection_id, rule_id).await?;
        match self.storage.delete_rule(plugin, connection_id, rule_id).await? {
            Deletion::Deleted => {
                info!("Deleted transformation rule {}", rule_id);
                Ok(rule)
            }
            Deletion::NotFound => Err(ServiceError::not_found("transformation_rule", rule_id)),
            Deletion::InUse(scope_ids) => Err(ServiceError::RuleInUse { rule_id, scope_ids }),
        }
    }

    async fn ensure_unique_name(
        &self,
        plugin: &str,
        connection_id: i64,
        name: &str,
        except: Option<i64>,
    ) -> ServiceResult<()> {
        let taken = self
            .storage
            .list_rules(plugin, connection_id)
            .await?
            .iter()
            .any(|r| r.name == name && Some(r.id) != except);
        if taken {
            return Err(ServiceError::validation(format!(
                "transformation rule name {} is already used on connection {}",
                name, connection_id
            )));
        }
        Ok(())
    }
}

fn duplicate_name(e: StorageError) -> ServiceError {
    match e {
        StorageError::Conflict { message, .. } => {
            ServiceError::validation(format!("duplicate transformation rule: {}", message))
        }
        other => other.into(),
    }
}
