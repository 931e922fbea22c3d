//! Task engine: runs the tasks of one stage and reports each completion.

use crate::models::{DomainEntity, PipelineStage, PipelineTask, ScopeKey, TaskCompletion, TaskFailure};
use crate::models::plan::OPTION_ENTITIES;
use crate::plugins::{PluginRegistry, TaskContext};
use crate::storage::StorageBackend;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Executes a stage; every task yields exactly one completion unless the
/// receiver is dropped first, which aborts the stage.
pub trait TaskEngine: Send + Sync {
    fn submit(&self, stage_index: usize, stage: PipelineStage) -> mpsc::Receiver<TaskCompletion>;
}

/// Runs every task of a stage concurrently on the local runtime.
pub struct LocalTaskEngine {
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
}

impl LocalTaskEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, plugins: Arc<PluginRegistry>) -> Self {
        Self { storage, plugins }
    }
}

impl TaskEngine for LocalTaskEngine {
    fn submit(&self, stage_index: usize, stage: PipelineStage) -> mpsc::Receiver<TaskCompletion> {
        let (tx, rx) = mpsc::channel(stage.len().max(1));
        let storage = self.storage.clone();
        let plugins = self.plugins.clone();

        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for (task_index, task) in stage.into_iter().enumerate() {
                let storage = storage.clone();
                let plugins = plugins.clone();
                tasks.spawn(async move {
                    let plugin = task.plugin.clone();
                    let outcome = AssertUnwindSafe(run_task(storage, plugins, task))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "task panicked".to_string());
                            Err(TaskFailure::new("TaskPanicked", message))
                        });
                    TaskCompletion {
                        stage_index,
                        task_index,
                        plugin,
                        error: outcome.err(),
                    }
                });
            }

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Stage {} abandoned, aborting {} tasks", stage_index, tasks.len());
                        tasks.abort_all();
                        break;
                    }
                    joined = tasks.join_next() => match joined {
                        Some(Ok(completion)) => {
                            if tx.send(completion).await.is_err() {
                                tasks.abort_all();
                                break;
                            }
                        }
                        Some(Err(e)) => warn!("Task of stage {} did not finish: {}", stage_index, e),
                        None => break,
                    }
                }
            }
        });
        rx
    }
}

async fn run_task(
    storage: Arc<dyn StorageBackend>,
    plugins: Arc<PluginRegistry>,
    task: PipelineTask,
) -> Result<(), TaskFailure> {
    let plugin = plugins.get(&task.plugin).ok_or_else(|| {
        TaskFailure::new("PluginNotFound", format!("plugin {} is not registered", task.plugin))
    })?;
    let context = rehydrate(storage.as_ref(), task).await?;
    plugin.execute(context).await
}

/// Load the connection, scope and rule a task's options point at.
pub async fn rehydrate(
    storage: &dyn StorageBackend,
    task: PipelineTask,
) -> Result<TaskContext, TaskFailure> {
    let storage_failure = |e: crate::storage::StorageError| TaskFailure::new("StorageError", e.to_string());

    let entities = match task.options.get(OPTION_ENTITIES) {
        Some(raw) => serde_json::from_value::<Vec<DomainEntity>>(raw.clone())
            .map_err(|e| TaskFailure::new("InvalidTaskOptions", e.to_string()))?,
        None => Vec::new(),
    };

    let connection = match task.connection_id() {
        Some(connection_id) => Some(
            storage
                .get_connection(&task.plugin, connection_id)
                .await
                .map_err(storage_failure)?
                .ok_or_else(|| {
                    TaskFailure::new(
                        "ConnectionNotFound",
                        format!("connection {} of plugin {} is gone", connection_id, task.plugin),
                    )
                })?,
        ),
        None => None,
    };

    let scope = match (&connection, task.scope_id()) {
        (Some(connection), Some(scope_id)) => {
            let key = ScopeKey::new(task.plugin.clone(), connection.id, scope_id);
            Some(
                storage
                    .get_scope(&key)
                    .await
                    .map_err(storage_failure)?
                    .ok_or_else(|| TaskFailure::new("ScopeNotFound", format!("scope {} is gone", key)))?,
            )
        }
        _ => None,
    };

    let transformation_rule = match scope.as_ref().and_then(|s| s.transformation_rule_id) {
        Some(rule_id) => storage
            .get_rule(&task.plugin, scope.as_ref().map(|s| s.connection_id).unwrap_or_default(), rule_id)
            .await
            .map_err(storage_failure)?,
        None => None,
    };

    Ok(TaskContext {
        task,
        connection,
        scope,
        transformation_rule,
        entities,
    })
}
