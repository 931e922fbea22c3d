//! Remote scope discovery.
//!
//! Walks a plugin's remote hierarchy one level at a time. Plugin pages are
//! normalized into [`ScopeGroup`]s; callers either consume pages lazily
//! through [`RemoteScopeService::stream_children`] or let
//! [`RemoteScopeService::list_children`] drain them.

use super::error::{ServiceError, ServiceResult};
use super::scope_service::ScopeService;
use crate::models::{Connection, RemoteScopesOutput, Scope, ScopeGroup};
use crate::plugins::{PluginError, PluginRegistry};
use crate::storage::StorageBackend;
use futures_util::{Stream, TryStreamExt, stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Upper bound for a single plugin call.
    pub timeout: Duration,
    /// Pages drained before an eager listing gives up.
    pub max_pages: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_pages: 100,
        }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

pub struct RemoteScopeService {
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
    scopes: Arc<ScopeService>,
    settings: DiscoverySettings,
}

impl RemoteScopeService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        plugins: Arc<PluginRegistry>,
        scopes: Arc<ScopeService>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            storage,
            plugins,
            scopes,
            settings,
        }
    }

    async fn connection(&self, plugin: &str, connection_id: i64) -> ServiceResult<Connection> {
        self.storage
            .get_connection(plugin, connection_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("connection", connection_id))
    }

    /// One page of children of `group_id` (the root when `None`).
    pub async fn list_page(
        &self,
        plugin: &str,
        connection_id: i64,
        group_id: Option<&str>,
        page_token: Option<&str>,
    ) -> ServiceResult<RemoteScopesOutput> {
        let lister = self
            .plugins
            .get(plugin)
            .ok_or_else(|| ServiceError::not_found("plugin", plugin))?;
        let connection = self.connection(plugin, connection_id).await?;
        let group_id = group_id.filter(|g| !g.is_empty());
        let page_token = page_token.filter(|t| !t.is_empty());

        let call = lister.list_groups(&connection, group_id, page_token);
        let page = match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(Ok(page)) => page,
            Ok(Err(PluginError::NotFound(_))) => {
                return Err(ServiceError::not_found(
                    "remote_group",
                    group_id.unwrap_or("<root>"),
                ));
            }
            Ok(Err(source)) => {
                return Err(ServiceError::DiscoveryFailed {
                    connection_id,
                    source,
                });
            }
            Err(_) => {
                return Err(ServiceError::DiscoveryFailed {
                    connection_id,
                    source: PluginError::Timeout(self.settings.timeout),
                });
            }
        };
        debug!(
            "Discovered {} entries under {:?} on {} connection {}",
            page.entries.len(),
            group_id,
            plugin,
            connection_id
        );
        let children = page
            .entries
            .into_iter()
            .map(|entry| ScopeGroup::from_entry(entry, group_id))
            .collect();
        Ok(RemoteScopesOutput {
            children,
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    /// Pages of children, fetched only as the stream is polled.
    pub fn stream_children<'a>(
        &'a self,
        plugin: &'a str,
        connection_id: i64,
        group_id: Option<&'a str>,
    ) -> impl Stream<Item = ServiceResult<Vec<ScopeGroup>>> + Send + 'a {
        stream::try_unfold((Cursor::Start, 0usize), move |(cursor, pages)| async move {
            let token = match cursor {
                Cursor::Done => return Ok(None),
                Cursor::Start => None,
                Cursor::Next(token) => Some(token),
            };
            if pages >= self.settings.max_pages {
                return Err(ServiceError::DiscoveryFailed {
                    connection_id,
                    source: PluginError::Upstream(format!(
                        "listing exceeded {} pages",
                        self.settings.max_pages
                    )),
                });
            }
            let page = self
                .list_page(plugin, connection_id, group_id, token.as_deref())
                .await?;
            let next = match page.next_page_token {
                Some(token) => Cursor::Next(token),
                None => Cursor::Done,
            };
            Ok(Some((page.children, (next, pages + 1))))
        })
    }

    /// Every child of `group_id` across all pages, in discovery order.
    pub async fn list_children(
        &self,
        plugin: &str,
        connection_id: i64,
        group_id: Option<&str>,
    ) -> ServiceResult<Vec<ScopeGroup>> {
        self.stream_children(plugin, connection_id, group_id)
            .try_concat()
            .await
    }

    /// Import the named leaves of `group_id` into the scope registry.
    ///
    /// Discovery runs to completion before anything is written.
    pub async fn import_remote_scopes(
        &self,
        plugin: &str,
        connection_id: i64,
        group_id: Option<&str>,
        scope_ids: &[String],
    ) -> ServiceResult<Vec<Scope>> {
        let children = self.list_children(plugin, connection_id, group_id).await?;
        let mut raw = Vec::with_capacity(scope_ids.len());
        for scope_id in scope_ids {
            let leaf = children
                .iter()
                .find(|c| c.is_scope() && &c.id == scope_id)
                .ok_or_else(|| ServiceError::not_found("remote_scope", scope_id))?;
            let mut data = leaf
                .data
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));
            if let Some(obj) = data.as_object_mut() {
                obj.entry("id").or_insert_with(|| leaf.id.clone().into());
                obj.entry("name").or_insert_with(|| leaf.name.clone().into());
            }
            raw.push(data);
        }
        let imported = self.scopes.upsert_raw(plugin, connection_id, raw).await?;
        info!(
            "Imported {} remote scopes into {} connection {}",
            imported.len(),
            plugin,
            connection_id
        );
        Ok(imported)
    }
}
