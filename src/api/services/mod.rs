//! Services module - the control-plane components over a shared storage backend.

pub mod blueprint_service;
pub mod connection_service;
pub mod discovery_service;
pub mod error;
pub mod locks;
pub mod pipeline_service;
pub mod project_service;
pub mod rule_service;
pub mod scope_service;
pub mod task_engine;

pub use blueprint_service::{BlueprintCompiler, BlueprintService, CompiledPlan};
pub use connection_service::ConnectionService;
pub use discovery_service::{DiscoverySettings, RemoteScopeService};
pub use error::{ServiceError, ServiceResult};
pub use locks::{ConnectionGuard, ConnectionLocks};
pub use pipeline_service::PipelineOrchestrator;
pub use project_service::ProjectService;
pub use rule_service::TransformationRuleService;
pub use scope_service::{DeleteScopeOptions, ScopeDeletionCoordinator, ScopeService};
pub use task_engine::{LocalTaskEngine, TaskEngine};
