//! Pipeline plans and their versioned persisted form.
//!
//! A plan is an ordered list of stages; a stage is an unordered set of tasks.
//! Stages run strictly in sequence, tasks within a stage carry no ordering.

use super::scope::ScopeKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

pub const OPTION_CONNECTION_ID: &str = "connectionId";
pub const OPTION_SCOPE_ID: &str = "scopeId";
pub const OPTION_ENTITIES: &str = "entities";
pub const OPTION_TRANSFORMATION_RULE_ID: &str = "transformationRuleId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    pub plugin: String,
    #[serde(default)]
    pub subtasks: Option<Vec<String>>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl PipelineTask {
    pub fn connection_id(&self) -> Option<i64> {
        match self.options.get(OPTION_CONNECTION_ID)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn scope_id(&self) -> Option<String> {
        match self.options.get(OPTION_SCOPE_ID)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The scope this task collects, when its options name one.
    pub fn scope_key(&self) -> Option<ScopeKey> {
        Some(ScopeKey::new(
            self.plugin.clone(),
            self.connection_id()?,
            self.scope_id()?,
        ))
    }
}

pub type PipelineStage = Vec<PipelineTask>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelinePlan(pub Vec<PipelineStage>);

impl PipelinePlan {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self(stages)
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.0
    }

    pub fn task_count(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    pub fn scope_keys(&self) -> Vec<ScopeKey> {
        let mut keys: Vec<ScopeKey> = self
            .0
            .iter()
            .flatten()
            .filter_map(PipelineTask::scope_key)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Drop every task bound to `key`, then any stage left empty.
    /// Returns whether anything was removed.
    pub fn remove_scope_tasks(&mut self, key: &ScopeKey) -> bool {
        let before = self.task_count();
        for stage in &mut self.0 {
            stage.retain(|task| task.scope_key().as_ref() != Some(key));
        }
        self.0.retain(|stage| !stage.is_empty());
        before != self.task_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanVersion {
    V100,
    V200,
}

impl fmt::Display for PlanVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanVersion::V100 => f.write_str("V100"),
            PlanVersion::V200 => f.write_str("V200"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanDecodeError {
    #[error("malformed {version} plan: {message}")]
    Malformed { version: PlanVersion, message: String },
}

/// Plan as stored on a blueprint: an explicit schema version plus its body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPlan {
    pub version: PlanVersion,
    pub body: Value,
}

impl PersistedPlan {
    pub fn encode(version: PlanVersion, plan: &PipelinePlan) -> Self {
        let stages = serde_json::to_value(plan).unwrap_or_else(|_| json!([]));
        let body = match version {
            PlanVersion::V100 => stages,
            PlanVersion::V200 => json!({ "stages": stages }),
        };
        Self { version, body }
    }

    pub fn empty() -> Self {
        Self::encode(PlanVersion::V200, &PipelinePlan::default())
    }

    pub fn decode(&self) -> Result<PipelinePlan, PlanDecodeError> {
        decode_plan(self.version, &self.body)
    }
}

pub fn decode_plan(version: PlanVersion, body: &Value) -> Result<PipelinePlan, PlanDecodeError> {
    match version {
        PlanVersion::V100 => decode_v100(body),
        PlanVersion::V200 => decode_v200(body),
    }
}

/// V100 stores the bare stage array.
fn decode_v100(body: &Value) -> Result<PipelinePlan, PlanDecodeError> {
    PipelinePlan::deserialize(body).map_err(|e| PlanDecodeError::Malformed {
        version: PlanVersion::V100,
        message: e.to_string(),
    })
}

/// V200 wraps the stages in an object so it can grow sibling fields.
fn decode_v200(body: &Value) -> Result<PipelinePlan, PlanDecodeError> {
    let malformed = |message: String| PlanDecodeError::Malformed {
        version: PlanVersion::V200,
        message,
    };
    let stages = body
        .get("stages")
        .ok_or_else(|| malformed("missing `stages`".to_string()))?;
    PipelinePlan::deserialize(stages).map_err(|e| malformed(e.to_string()))
}
