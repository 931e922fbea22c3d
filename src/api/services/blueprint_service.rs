//! Blueprint compilation and lifecycle.
//!
//! A NORMAL blueprint compiles to `before_plan` stages, one collection stage
//! with a task per bound scope, then `after_plan` stages. An ADVANCED
//! blueprint carries its own plan, which is checked but kept as written.

use super::error::{ServiceError, ServiceResult};
use super::locks::{ConnectionGuard, ConnectionLocks};
use super::pipeline_service::PipelineOrchestrator;
use crate::models::plan::{
    OPTION_CONNECTION_ID, OPTION_ENTITIES, OPTION_SCOPE_ID, OPTION_TRANSFORMATION_RULE_ID,
};
use crate::models::{
    Blueprint, BlueprintMode, BlueprintPatch, BlueprintSettings, NewBlueprint, NewPipeline,
    PersistedPlan, Pipeline, PipelinePlan, PipelineStage, PipelineTask, PlanVersion, ScopeKey,
};
use crate::storage::{StorageBackend, StorageError};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// A freshly compiled plan and the connection locks it was compiled under.
///
/// Keep it alive until the plan is persisted; dropping it releases the locks.
pub struct CompiledPlan {
    pub plan: PipelinePlan,
    guard: ConnectionGuard,
}

impl CompiledPlan {
    pub fn into_parts(self) -> (PipelinePlan, ConnectionGuard) {
        (self.plan, self.guard)
    }
}

pub struct BlueprintCompiler {
    storage: Arc<dyn StorageBackend>,
    locks: Arc<ConnectionLocks>,
}

impl BlueprintCompiler {
    pub fn new(storage: Arc<dyn StorageBackend>, locks: Arc<ConnectionLocks>) -> Self {
        Self { storage, locks }
    }

    /// Compile `blueprint` against the current scope registry.
    ///
    /// Fails as a whole on the first binding or hook task whose scope is gone.
    pub async fn compile(&self, blueprint: &Blueprint) -> ServiceResult<CompiledPlan> {
        match blueprint.mode {
            BlueprintMode::Normal => {
                let settings = blueprint.settings.as_ref().ok_or_else(|| {
                    ServiceError::validation("NORMAL blueprints require settings")
                })?;
                self.compile_settings(blueprint, settings).await
            }
            BlueprintMode::Advanced => {
                let plan = blueprint
                    .unmarshal_plan()
                    .map_err(|e| ServiceError::validation(e.to_string()))?;
                self.check_plan(blueprint, plan).await
            }
        }
    }

    async fn compile_settings(
        &self,
        blueprint: &Blueprint,
        settings: &BlueprintSettings,
    ) -> ServiceResult<CompiledPlan> {
        settings.validate().map_err(ServiceError::ValidationFailed)?;
        let guard = self.locks.lock_many(settings.connection_keys()).await;

        let mut collection: PipelineStage = Vec::new();
        for binding in &settings.connections {
            self.storage
                .get_connection(&binding.plugin, binding.connection_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("connection", binding.connection_id))?;
            for bound in &binding.scopes {
                let key = ScopeKey::new(binding.plugin.clone(), binding.connection_id, bound.id.clone());
                let scope = self
                    .storage
                    .get_scope(&key)
                    .await?
                    .ok_or_else(|| scope_not_found(blueprint, &key))?;
                let entities: Vec<&str> = bound
                    .effective_entities()
                    .iter()
                    .map(|e| e.as_str())
                    .collect();
                let mut options = Map::new();
                options.insert(OPTION_CONNECTION_ID.into(), json!(binding.connection_id));
                options.insert(OPTION_SCOPE_ID.into(), json!(scope.id));
                options.insert(OPTION_ENTITIES.into(), json!(entities));
                if let Some(rule_id) = scope.transformation_rule_id {
                    options.insert(OPTION_TRANSFORMATION_RULE_ID.into(), json!(rule_id));
                }
                collection.push(PipelineTask {
                    plugin: binding.plugin.clone(),
                    subtasks: None,
                    options,
                });
            }
        }
        for key in settings.hook_scope_keys() {
            if self.storage.get_scope(&key).await?.is_none() {
                return Err(scope_not_found(blueprint, &key));
            }
        }

        let mut stages: Vec<PipelineStage> = Vec::new();
        if let Some(before) = &settings.before_plan {
            stages.extend(before.stages().iter().cloned());
        }
        if !collection.is_empty() {
            stages.push(collection);
        }
        if let Some(after) = &settings.after_plan {
            stages.extend(after.stages().iter().cloned());
        }
        stages.retain(|stage| !stage.is_empty());
        Ok(CompiledPlan {
            plan: PipelinePlan::new(stages),
            guard,
        })
    }

    /// Hand-written plans must still point at live scopes.
    async fn check_plan(
        &self,
        blueprint: &Blueprint,
        plan: PipelinePlan,
    ) -> ServiceResult<CompiledPlan> {
        for task in plan.stages().iter().flatten() {
            if task.plugin.trim().is_empty() {
                return Err(ServiceError::validation("every task must name a plugin"));
            }
        }
        let keys = plan.scope_keys();
        let guard = self
            .locks
            .lock_many(keys.iter().map(|k| (k.plugin.clone(), k.connection_id)))
            .await;
        for key in &keys {
            if self.storage.get_scope(key).await?.is_none() {
                return Err(scope_not_found(blueprint, key));
            }
        }
        Ok(CompiledPlan { plan, guard })
    }
}

fn scope_not_found(blueprint: &Blueprint, key: &ScopeKey) -> ServiceError {
    let label = if blueprint.id > 0 {
        format!("{} ({})", blueprint.id, blueprint.name)
    } else {
        blueprint.name.clone()
    };
    ServiceError::ScopeNotFound {
        blueprint: label,
        plugin: key.plugin.clone(),
        connection_id: key.connection_id,
        scope_id: key.scope_id.clone(),
    }
}

pub struct BlueprintService {
    storage: Arc<dyn StorageBackend>,
    compiler: BlueprintCompiler,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl BlueprintService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        locks: Arc<ConnectionLocks>,
        orchestrator: Arc<PipelineOrchestrator>,
    ) -> Self {
        Self {
            compiler: BlueprintCompiler::new(storage.clone(), locks),
            storage,
            orchestrator,
        }
    }

    pub fn compiler(&self) -> &BlueprintCompiler {
        &self.compiler
    }

    pub async fn create(&self, new: NewBlueprint) -> ServiceResult<Blueprint> {
        let now = Utc::now();
        let mut draft = Blueprint {
            id: 0,
            name: new.name.trim().to_string(),
            project_name: new.project_name.filter(|p| !p.trim().is_empty()),
            mode: new.mode,
            enable: new.enable,
            cron_config: new.cron_config,
            is_manual: new.is_manual,
            skip_on_fail: new.skip_on_fail,
            settings: new.settings,
            plan: new
                .plan
                .map(|p| PersistedPlan::encode(PlanVersion::V200, &p))
                .unwrap_or_else(PersistedPlan::empty),
            created_at: now,
            updated_at: now,
        };
        self.validate(&draft).await?;

        let (plan, _guard) = self.compiler.compile(&draft).await?.into_parts();
        draft.plan = PersistedPlan::encode(PlanVersion::V200, &plan);
        let created = self
            .storage
            .create_blueprint(draft)
            .await
            .map_err(project_taken)?;
        info!(
            "Created blueprint {} ({}) with {} tasks",
            created.id,
            created.name,
            plan.task_count()
        );
        Ok(created)
    }

    pub async fn get(&self, blueprint_id: i64) -> ServiceResult<Blueprint> {
        self.storage
            .get_blueprint(blueprint_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("blueprint", blueprint_id))
    }

    pub async fn list(&self) -> ServiceResult<Vec<Blueprint>> {
        Ok(self.storage.list_blueprints().await?)
    }

    /// Apply `patch`, recompile and rewrite the scope index.
    pub async fn update(&self, blueprint_id: i64, patch: BlueprintPatch) -> ServiceResult<Blueprint> {
        let mut blueprint = self.get(blueprint_id).await?;
        if let Some(name) = patch.name {
            blueprint.name = name.trim().to_string();
        }
        if let Some(project_name) = patch.project_name {
            blueprint.project_name = Some(project_name).filter(|p| !p.trim().is_empty());
        }
        if let Some(enable) = patch.enable {
            blueprint.enable = enable;
        }
        if let Some(cron_config) = patch.cron_config {
            blueprint.cron_config = cron_config;
        }
        if let Some(is_manual) = patch.is_manual {
            blueprint.is_manual = is_manual;
        }
        if let Some(skip_on_fail) = patch.skip_on_fail {
            blueprint.skip_on_fail = skip_on_fail;
        }
        if let Some(settings) = patch.settings {
            blueprint.settings = Some(settings);
        }
        if let Some(plan) = patch.plan {
            blueprint.plan = PersistedPlan::encode(PlanVersion::V200, &plan);
        }
        blueprint.updated_at = Utc::now();
        self.validate(&blueprint).await?;

        let (plan, _guard) = self.compiler.compile(&blueprint).await?.into_parts();
        blueprint.plan = PersistedPlan::encode(PlanVersion::V200, &plan);
        self.storage
            .update_blueprint(&blueprint)
            .await
            .map_err(project_taken)?;
        info!("Updated blueprint {}", blueprint_id);
        Ok(blueprint)
    }

    pub async fn delete(&self, blueprint_id: i64) -> ServiceResult<()> {
        if !self.storage.delete_blueprint(blueprint_id).await? {
            return Err(ServiceError::not_found("blueprint", blueprint_id));
        }
        info!("Deleted blueprint {}", blueprint_id);
        Ok(())
    }

    /// Recompile against the live registry, store the fresh plan and start a
    /// pipeline. With `wait` the call returns once the pipeline has ended.
    pub async fn trigger(&self, blueprint_id: i64, wait: bool) -> ServiceResult<Pipeline> {
        let mut blueprint = self.get(blueprint_id).await?;
        let plan = loop {
            if !blueprint.enable {
                return Err(ServiceError::validation(format!(
                    "blueprint {} is disabled",
                    blueprint_id
                )));
            }
            let (plan, _guard) = self.compiler.compile(&blueprint).await.inspect_err(|e| {
                warn!("Blueprint {} failed to compile: {}", blueprint_id, e);
            })?.into_parts();
            // Written while compiling: start over from the stored row.
            let current = self.get(blueprint_id).await?;
            if current != blueprint {
                info!("Blueprint {} changed during compile, recompiling", blueprint_id);
                blueprint = current;
                continue;
            }
            blueprint.plan = PersistedPlan::encode(PlanVersion::V200, &plan);
            blueprint.updated_at = Utc::now();
            self.storage.update_blueprint(&blueprint).await?;
            break plan;
        };
        let new = NewPipeline {
            name: blueprint.name.clone(),
            plan,
            skip_on_fail: blueprint.skip_on_fail,
            blueprint_id: Some(blueprint.id),
        };
        info!("Triggering blueprint {}", blueprint_id);
        if wait {
            self.orchestrator.run_pipeline(new).await
        } else {
            self.orchestrator.submit_pipeline(new).await
        }
    }

    async fn validate(&self, blueprint: &Blueprint) -> ServiceResult<()> {
        if blueprint.name.is_empty() {
            return Err(ServiceError::validation("blueprint name must not be empty"));
        }
        match blueprint.mode {
            BlueprintMode::Normal => {
                let settings = blueprint.settings.as_ref().ok_or_else(|| {
                    ServiceError::validation("NORMAL blueprints require settings")
                })?;
                settings.validate().map_err(ServiceError::ValidationFailed)?;
            }
            BlueprintMode::Advanced => {
                if blueprint.settings.is_some() {
                    return Err(ServiceError::validation(
                        "ADVANCED blueprints carry a plan, not settings",
                    ));
                }
            }
        }
        if let Some(project_name) = &blueprint.project_name {
            self.storage
                .get_project(project_name)
                .await?
                .ok_or_else(|| ServiceError::not_found("project", project_name))?;
            if let Some(bound) = self.storage.get_blueprint_by_project(project_name).await? {
                if bound.id != blueprint.id {
                    return Err(ServiceError::validation(format!(
                        "project {} already has blueprint {}",
                        project_name, bound.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn project_taken(e: StorageError) -> ServiceError {
    match e {
        StorageError::Conflict { message, .. } => ServiceError::validation(format!(
            "blueprint conflicts with an existing one: {}",
            message
        )),
        other => other.into(),
    }
}

/// A collection task for one scope, shaped like the ones the compiler emits.
pub fn scope_task(plugin: &str, connection_id: i64, scope_id: &str, entities: &[&str]) -> PipelineTask {
    let mut options = Map::new();
    options.insert(OPTION_CONNECTION_ID.into(), Value::from(connection_id));
    options.insert(OPTION_SCOPE_ID.into(), Value::from(scope_id));
    options.insert(OPTION_ENTITIES.into(), json!(entities));
    PipelineTask {
        plugin: plugin.to_string(),
        subtasks: None,
        options,
    }
}
