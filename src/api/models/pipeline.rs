use super::enums::PipelineStatus;
use super::plan::PipelinePlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPipeline {
    pub name: String,
    pub plan: PipelinePlan,
    #[serde(default)]
    pub skip_on_fail: bool,
    #[serde(default)]
    pub blueprint_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    pub blueprint_id: Option<i64>,
    pub plan: PipelinePlan,
    pub status: PipelineStatus,
    pub total_tasks: usize,
    pub finished_tasks: usize,
    pub failed_tasks: usize,
    /// Empty when no task failed.
    pub error_name: String,
    pub skip_on_fail: bool,
    pub created_at: DateTime<Utc>,
    pub began_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn pending(new: NewPipeline, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: new.name,
            blueprint_id: new.blueprint_id,
            total_tasks: new.plan.task_count(),
            plan: new.plan,
            status: PipelineStatus::Created,
            finished_tasks: 0,
            failed_tasks: 0,
            error_name: String::new(),
            skip_on_fail: new.skip_on_fail,
            created_at: now,
            began_at: None,
            finished_at: None,
        }
    }

    /// Record the first failure only; later ones just count.
    pub fn record_failure(&mut self, error_name: &str) {
        self.failed_tasks += 1;
        if self.error_name.is_empty() {
            self.error_name = error_name.to_string();
        }
    }
}

/// Outcome of one task as reported by the task engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletion {
    pub stage_index: usize,
    pub task_index: usize,
    pub plugin: String,
    pub error: Option<TaskFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}")]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub name: String,
    #[serde(default)]
    pub message: String,
}

impl TaskFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}
