//! In-process plugin with a fixed remote hierarchy.
//!
//! Serves one root group `group1` holding projects `p1..pN`. Tasks succeed
//! unless their options carry `"simulateError": true`.

use super::{Plugin, PluginError, RemoteScopeLister, ScopeConvertible, TaskContext, TaskExecutor};
use crate::models::{Connection, RemoteEntry, RemoteScopePage, Scope, ScopeGroupType, TaskFailure};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const FAKE_PLUGIN_NAME: &str = "fake";
pub const FAKE_BASE_URL: &str = "http://fake.org/api";
pub const SIMULATE_ERROR_OPTION: &str = "simulateError";

const ROOT: &str = "";

/// A task the fake plugin ran, as it saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedTask {
    pub scope_id: Option<String>,
    pub scope_url: Option<String>,
    pub transformation_rule: Option<String>,
    pub entities: Vec<String>,
}

pub struct FakePlugin {
    name: String,
    tree: HashMap<String, Vec<RemoteEntry>>,
    page_size: usize,
    task_delay: Option<Duration>,
    listing_delay: Option<Duration>,
    executed: Mutex<Vec<ExecutedTask>>,
    purged: Mutex<Vec<String>>,
}

impl FakePlugin {
    pub fn new() -> Self {
        Self::with_projects(1)
    }

    /// `group1` holding `count` projects.
    pub fn with_projects(count: usize) -> Self {
        let projects = (1..=count)
            .map(|i| {
                let id = format!("p{}", i);
                let name = format!("Project {}", i);
                let data = json!({
                    "id": id,
                    "name": name,
                    "url": format!("{}/project/{}", FAKE_BASE_URL, id),
                });
                RemoteEntry::scope(id, name, data)
            })
            .collect();
        let mut tree = HashMap::new();
        tree.insert(ROOT.to_string(), vec![RemoteEntry::group("group1", "Group 1")]);
        tree.insert("group1".to_string(), projects);
        Self {
            name: FAKE_PLUGIN_NAME.to_string(),
            tree,
            page_size: 100,
            task_delay: None,
            listing_delay: None,
            executed: Mutex::new(Vec::new()),
            purged: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add `entry` below `parent` (the root when `None`).
    pub fn with_entry(mut self, parent: Option<&str>, entry: RemoteEntry) -> Self {
        self.tree
            .entry(parent.unwrap_or(ROOT).to_string())
            .or_default()
            .push(entry);
        self
    }

    pub fn with_task_delay(mut self, delay: Duration) -> Self {
        self.task_delay = Some(delay);
        self
    }

    pub fn with_listing_delay(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<ExecutedTask> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn purged(&self) -> Vec<String> {
        self.purged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for FakePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteScopeLister for FakePlugin {
    async fn list_groups(
        &self,
        connection: &Connection,
        group_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<RemoteScopePage, PluginError> {
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        let key = group_id.unwrap_or(ROOT);
        let children = self
            .tree
            .get(key)
            .ok_or_else(|| PluginError::NotFound(key.to_string()))?;
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| PluginError::InvalidPayload(format!("bad page token {}", token)))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(children.len());
        let mut entries = children.get(offset..end).unwrap_or_default().to_vec();
        for entry in entries.iter_mut().filter(|e| e.kind == ScopeGroupType::Scope) {
            if let Some(Value::Object(data)) = entry.data.as_mut() {
                data.insert("connectionId".into(), connection.id.into());
            }
        }
        let next_page_token = (end < children.len()).then(|| end.to_string());
        Ok(RemoteScopePage {
            entries,
            next_page_token,
        })
    }
}

impl ScopeConvertible for FakePlugin {}

#[async_trait]
impl TaskExecutor for FakePlugin {
    async fn execute(&self, context: TaskContext) -> Result<(), TaskFailure> {
        if let Some(delay) = self.task_delay {
            tokio::time::sleep(delay).await;
        }
        let simulate_error = context
            .task
            .options
            .get(SIMULATE_ERROR_OPTION)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if simulate_error {
            return Err(TaskFailure::new(
                "SimulatedError",
                "task asked to fail by its options",
            ));
        }
        let record = ExecutedTask {
            scope_id: context.scope.as_ref().map(|s| s.id.clone()),
            scope_url: context
                .scope
                .as_ref()
                .and_then(|s| s.data.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            transformation_rule: context.transformation_rule.as_ref().map(|r| r.name.clone()),
            entities: context.entities.iter().map(|e| e.as_str().to_string()).collect(),
        };
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

#[async_trait]
impl Plugin for FakePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purge_scope_data(
        &self,
        _connection: &Connection,
        scope: &Scope,
    ) -> Result<(), PluginError> {
        self.purged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(scope.id.clone());
        Ok(())
    }
}
