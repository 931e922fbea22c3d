use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain entity families a blueprint scope can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DomainEntity {
    #[serde(rename = "CODE")]
    Code,
    #[serde(rename = "TICKET")]
    Ticket,
    #[serde(rename = "CODEREVIEW")]
    CodeReview,
    #[serde(rename = "CROSS")]
    Cross,
    #[serde(rename = "CICD")]
    Cicd,
    #[serde(rename = "CODEQUALITY")]
    CodeQuality,
}

impl DomainEntity {
    pub const ALL: [DomainEntity; 6] = [
        DomainEntity::Code,
        DomainEntity::Ticket,
        DomainEntity::CodeReview,
        DomainEntity::Cross,
        DomainEntity::Cicd,
        DomainEntity::CodeQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEntity::Code => "CODE",
            DomainEntity::Ticket => "TICKET",
            DomainEntity::CodeReview => "CODEREVIEW",
            DomainEntity::Cross => "CROSS",
            DomainEntity::Cicd => "CICD",
            DomainEntity::CodeQuality => "CODEQUALITY",
        }
    }
}

impl fmt::Display for DomainEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainEntity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DomainEntity::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown domain entity: {}", s))
    }
}

/// Node kind in a remote scope hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeGroupType {
    Group,
    Scope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlueprintMode {
    Normal,
    Advanced,
}

impl BlueprintMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlueprintMode::Normal => "NORMAL",
            BlueprintMode::Advanced => "ADVANCED",
        }
    }
}

impl FromStr for BlueprintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(BlueprintMode::Normal),
            "ADVANCED" => Ok(BlueprintMode::Advanced),
            other => Err(format!("unknown blueprint mode: {}", other)),
        }
    }
}

/// Pipeline lifecycle. `Created` is the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    #[serde(rename = "TASK_CREATED")]
    Created,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_COMPLETED")]
    Completed,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_CANCELLED")]
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Created => "TASK_CREATED",
            PipelineStatus::Running => "TASK_RUNNING",
            PipelineStatus::Completed => "TASK_COMPLETED",
            PipelineStatus::Failed => "TASK_FAILED",
            PipelineStatus::Cancelled => "TASK_CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }

    /// Transitions only move forward: created -> running -> terminal.
    /// A pending pipeline may be cancelled before it starts.
    pub fn can_transition_to(&self, next: PipelineStatus) -> bool {
        match (self, next) {
            (PipelineStatus::Created, PipelineStatus::Running) => true,
            (PipelineStatus::Created, PipelineStatus::Cancelled) => true,
            (PipelineStatus::Running, PipelineStatus::Running) => true,
            (PipelineStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK_CREATED" => Ok(PipelineStatus::Created),
            "TASK_RUNNING" => Ok(PipelineStatus::Running),
            "TASK_COMPLETED" => Ok(PipelineStatus::Completed),
            "TASK_FAILED" => Ok(PipelineStatus::Failed),
            "TASK_CANCELLED" => Ok(PipelineStatus::Cancelled),
            other => Err(format!("unknown pipeline status: {}", other)),
        }
    }
}
