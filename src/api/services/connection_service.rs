//! Connection registry.

use super::error::{ServiceError, ServiceResult};
use crate::models::{Connection, ConnectionPatch, NewConnection};
use crate::plugins::{Plugin, PluginRegistry};
use crate::storage::{Deletion, StorageBackend, StorageError};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use url::Url;

pub struct ConnectionService {
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
}

impl ConnectionService {
    pub fn new(storage: Arc<dyn StorageBackend>, plugins: Arc<PluginRegistry>) -> Self {
        Self { storage, plugins }
    }

    /// Resolve a registered plugin by name.
    pub fn plugin(&self, plugin: &str) -> ServiceResult<Arc<dyn Plugin>> {
        self.plugins
            .get(plugin)
            .ok_or_else(|| ServiceError::not_found("plugin", plugin))
    }

    pub async fn create(&self, plugin: &str, new: NewConnection) -> ServiceResult<Connection> {
        self.plugin(plugin)?;
        let connection = new.into_connection(plugin, Utc::now());
        validate(&connection)?;
        self.ensure_unique_name(&connection).await?;
        let created = self
            .storage
            .create_connection(connection)
            .await
            .map_err(duplicate_name)?;
        info!(
            "Created connection {} ({}) for plugin {}",
            created.id, created.name, plugin
        );
        Ok(created)
    }

    pub async fn get(&self, plugin: &str, connection_id: i64) -> ServiceResult<Connection> {
        self.storage
            .get_connection(plugin, connection_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("connection", connection_id))
    }

    pub async fn list(&self, plugin: &str) -> ServiceResult<Vec<Connection>> {
        self.plugin(plugin)?;
        Ok(self.storage.list_connections(plugin).await?)
    }

    pub async fn update(
        &self,
        plugin: &str,
        connection_id: i64,
        patch: ConnectionPatch,
    ) -> ServiceResult<Connection> {
        let mut connection = self.get(plugin, connection_id).await?;
        connection.apply_patch(patch, Utc::now());
        validate(&connection)?;
        self.ensure_unique_name(&connection).await?;
        self.storage
            .update_connection(&connection)
            .await
            .map_err(duplicate_name)?;
        info!("Updated connection {} of plugin {}", connection_id, plugin);
        Ok(connection)
    }

    /// Delete a connection that no scope or rule references any more.
    pub async fn delete(&self, plugin: &str, connection_id: i64) -> ServiceResult<Connection> {
        let connection = self.get(plugin, connection_id).await?;
        match self.storage.delete_connection(plugin, connection_id).await? {
            Deletion::Deleted => {
                info!("Deleted connection {} of plugin {}", connection_id, plugin);
                Ok(connection)
            }
            Deletion::NotFound => Err(ServiceError::not_found("connection", connection_id)),
            Deletion::InUse(dependents) => Err(ServiceError::ConnectionInUse {
                connection_id,
                scopes: dependents.scopes,
                rules: dependents.rules,
            }),
        }
    }

    async fn ensure_unique_name(&self, connection: &Connection) -> ServiceResult<()> {
        let taken = self
            .storage
            .list_connections(&connection.plugin)
            .await?
            .into_iter()
            .any(|c| c.name == connection.name && c.id != connection.id);
        if taken {
            return Err(ServiceError::validation(format!(
                "connection name {} is already used by plugin {}",
                connection.name, connection.plugin
            )));
        }
        Ok(())
    }
}

fn validate(connection: &Connection) -> ServiceResult<()> {
    if connection.name.trim().is_empty() {
        return Err(ServiceError::validation("connection name must not be empty"));
    }
    Url::parse(&connection.endpoint).map_err(|e| {
        ServiceError::validation(format!(
            "connection endpoint {:?} is not a valid URL: {}",
            connection.endpoint, e
        ))
    })?;
    if let Some(proxy) = connection.proxy.as_deref().filter(|p| !p.is_empty()) {
        Url::parse(proxy).map_err(|e| {
            ServiceError::validation(format!("connection proxy {:?} is not a valid URL: {}", proxy, e))
        })?;
    }
    Ok(())
}

/// A unique-index race lost to a concurrent writer is still a duplicate name.
fn duplicate_name(e: StorageError) -> ServiceError {
    match e {
        StorageError::Conflict { message, .. } => {
            ServiceError::validation(format!("duplicate connection: {}", message))
        }
        other => other.into(),
    }
}
