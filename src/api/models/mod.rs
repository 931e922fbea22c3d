// Models module - connections, scopes, rules, blueprints, plans and pipelines

pub mod blueprint;
pub mod connection;
#[path = "enums.rs"]
pub mod enums;
pub mod pipeline;
pub mod plan;
pub mod project;
pub mod remote_scope;
pub mod scope;
pub mod transformation_rule;

pub use blueprint::{
    Blueprint, BlueprintConnection, BlueprintPatch, BlueprintScope, BlueprintSettings,
    NewBlueprint,
};
pub use connection::{Connection, ConnectionPatch, NewConnection};
pub use enums::{BlueprintMode, DomainEntity, PipelineStatus, ScopeGroupType};
pub use pipeline::{NewPipeline, Pipeline, TaskCompletion, TaskFailure};
pub use plan::{PersistedPlan, PipelinePlan, PipelineStage, PipelineTask, PlanVersion};
pub use project::{NewProject, Project, ProjectResponse};
pub use remote_scope::{RemoteEntry, RemoteScopePage, RemoteScopesOutput, ScopeGroup};
pub use scope::{BlueprintRef, Scope, ScopeInput, ScopeKey, ScopePatch, ScopeResponse};
pub use transformation_rule::{RulePayload, TransformationRule};
