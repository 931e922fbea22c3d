//! Pipeline orchestration.
//!
//! Stages run strictly in sequence; the tasks of a stage are handed to the
//! [`TaskEngine`] together and their completions folded into the persisted
//! pipeline record. Task failures are recorded, never returned as errors.

use super::error::{ServiceError, ServiceResult};
use super::task_engine::TaskEngine;
use crate::models::{NewPipeline, Pipeline, PipelineStage, PipelineStatus, TaskCompletion};
use crate::storage::StorageBackend;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Name recorded for tasks the engine never reported back.
pub const TASK_LOST: &str = "TaskLost";

pub struct PipelineOrchestrator {
    storage: Arc<dyn StorageBackend>,
    engine: Arc<dyn TaskEngine>,
    cancellations: Mutex<HashMap<i64, watch::Sender<bool>>>,
}

enum StageOutcome {
    Finished,
    Cancelled,
}

impl PipelineOrchestrator {
    pub fn new(storage: Arc<dyn StorageBackend>, engine: Arc<dyn TaskEngine>) -> Self {
        Self {
            storage,
            engine,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    fn validate(new: &NewPipeline) -> ServiceResult<()> {
        if new.name.trim().is_empty() {
            return Err(ServiceError::validation("pipeline name must not be empty"));
        }
        for (stage_index, stage) in new.plan.stages().iter().enumerate() {
            if let Some(task_index) = stage.iter().position(|t| t.plugin.trim().is_empty()) {
                return Err(ServiceError::validation(format!(
                    "task {} of stage {} has no plugin",
                    task_index, stage_index
                )));
            }
        }
        Ok(())
    }

    /// Persist a pending pipeline and register its cancellation channel.
    async fn create(&self, new: NewPipeline) -> ServiceResult<(Pipeline, watch::Receiver<bool>)> {
        Self::validate(&new)?;
        let pipeline = self
            .storage
            .create_pipeline(Pipeline::pending(new, Utc::now()))
            .await?;
        let (tx, rx) = watch::channel(false);
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pipeline.id, tx);
        info!(
            "Created pipeline {} ({}) with {} tasks",
            pipeline.id, pipeline.name, pipeline.total_tasks
        );
        Ok((pipeline, rx))
    }

    /// Run a plan to a terminal status and return the final record.
    ///
    /// Execution lives on its own task, so dropping the returned future
    /// does not stop the pipeline.
    pub async fn run_pipeline(self: &Arc<Self>, new: NewPipeline) -> ServiceResult<Pipeline> {
        let (pipeline, cancel) = self.create(new).await?;
        let id = pipeline.id;
        self.spawn(pipeline, cancel)
            .await
            .map_err(|e| ServiceError::ExecutionAborted {
                pipeline_id: id,
                reason: e.to_string(),
            })?
    }

    /// Start a plan in the background and return the pending record.
    pub async fn submit_pipeline(self: &Arc<Self>, new: NewPipeline) -> ServiceResult<Pipeline> {
        let (pipeline, cancel) = self.create(new).await?;
        let pending = pipeline.clone();
        drop(self.spawn(pipeline, cancel));
        Ok(pending)
    }

    fn spawn(
        self: &Arc<Self>,
        pipeline: Pipeline,
        cancel: watch::Receiver<bool>,
    ) -> JoinHandle<ServiceResult<Pipeline>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let id = pipeline.id;
            let result = orchestrator.execute(pipeline, cancel).await;
            if let Err(e) = &result {
                error!("Pipeline {} aborted: {}", id, e);
            }
            result
        })
    }

    pub async fn get_pipeline(&self, pipeline_id: i64) -> ServiceResult<Pipeline> {
        self.storage
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("pipeline", pipeline_id))
    }

    pub async fn list_pipelines(&self, blueprint_id: Option<i64>) -> ServiceResult<Vec<Pipeline>> {
        Ok(self.storage.list_pipelines(blueprint_id).await?)
    }

    /// Ask a pipeline to stop. Stages not yet started are skipped.
    pub async fn cancel_pipeline(&self, pipeline_id: i64) -> ServiceResult<Pipeline> {
        let mut pipeline = self.get_pipeline(pipeline_id).await?;
        if pipeline.status.is_terminal() {
            return Err(ServiceError::validation(format!(
                "pipeline {} already finished with {}",
                pipeline_id, pipeline.status
            )));
        }
        let signalled = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pipeline_id)
            .map(|tx| tx.send(true).is_ok())
            .unwrap_or(false);
        if signalled {
            info!("Cancellation requested for pipeline {}", pipeline_id);
            return Ok(pipeline);
        }

        // Nobody is driving this record (left over from an earlier process).
        transition(&mut pipeline, PipelineStatus::Cancelled)?;
        pipeline.finished_at = Some(Utc::now());
        self.storage.update_pipeline(&pipeline).await?;
        info!("Cancelled orphaned pipeline {}", pipeline_id);
        Ok(pipeline)
    }

    async fn execute(
        &self,
        mut pipeline: Pipeline,
        mut cancel: watch::Receiver<bool>,
    ) -> ServiceResult<Pipeline> {
        let result = self.drive(&mut pipeline, &mut cancel).await;
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pipeline.id);
        if let Err(e) = &result {
            self.abandon(&mut pipeline, e).await;
        }
        result.map(|()| pipeline)
    }

    /// Best-effort move of an aborted run to a terminal status.
    async fn abandon(&self, pipeline: &mut Pipeline, cause: &ServiceError) {
        if !pipeline.status.is_terminal() {
            pipeline.status = PipelineStatus::Failed;
        }
        if pipeline.error_name.is_empty() {
            pipeline.error_name = cause.code().to_string();
        }
        pipeline.finished_at = Some(Utc::now());
        match self.storage.update_pipeline(pipeline).await {
            Ok(()) => warn!(
                "Pipeline {} marked {} after: {}",
                pipeline.id, pipeline.status, cause
            ),
            Err(e) => error!(
                "Pipeline {} could not be marked {}: {}",
                pipeline.id, pipeline.status, e
            ),
        }
    }

    async fn drive(
        &self,
        pipeline: &mut Pipeline,
        cancel: &mut watch::Receiver<bool>,
    ) -> ServiceResult<()> {
        let mut cancelled = *cancel.borrow();
        if !cancelled {
            transition(pipeline, PipelineStatus::Running)?;
            pipeline.began_at = Some(Utc::now());
            self.storage.update_pipeline(pipeline).await?;

            let stages = pipeline.plan.stages().to_vec();
            for (stage_index, stage) in stages.into_iter().enumerate() {
                if *cancel.borrow() {
                    cancelled = true;
                    break;
                }
                if !pipeline.skip_on_fail && pipeline.failed_tasks > 0 {
                    info!(
                        "Pipeline {} stops before stage {} after a failure",
                        pipeline.id, stage_index
                    );
                    break;
                }
                if let StageOutcome::Cancelled =
                    self.run_stage(pipeline, stage_index, stage, cancel).await?
                {
                    cancelled = true;
                    break;
                }
            }
        }

        let status = if cancelled {
            PipelineStatus::Cancelled
        } else if pipeline.failed_tasks > 0 {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Completed
        };
        transition(pipeline, status)?;
        pipeline.finished_at = Some(Utc::now());
        self.storage.update_pipeline(pipeline).await?;
        info!(
            "Pipeline {} finished with {}: {} finished, {} failed",
            pipeline.id, pipeline.status, pipeline.finished_tasks, pipeline.failed_tasks
        );
        Ok(())
    }

    async fn run_stage(
        &self,
        pipeline: &mut Pipeline,
        stage_index: usize,
        stage: PipelineStage,
        cancel: &mut watch::Receiver<bool>,
    ) -> ServiceResult<StageOutcome> {
        let expected = stage.len();
        let mut completions = self.engine.submit(stage_index, stage);
        let mut reported = 0usize;
        let mut cancel_open = true;

        loop {
            tokio::select! {
                completion = completions.recv() => match completion {
                    Some(completion) => {
                        reported += 1;
                        apply_completion(pipeline, completion);
                        self.storage.update_pipeline(pipeline).await?;
                    }
                    None => break,
                },
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => {
                        // Dropping the receiver aborts the stage's tasks.
                        return Ok(StageOutcome::Cancelled);
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
            }
        }

        for _ in reported..expected {
            warn!(
                "Pipeline {} lost a task of stage {}",
                pipeline.id, stage_index
            );
            pipeline.record_failure(TASK_LOST);
        }
        if reported < expected {
            self.storage.update_pipeline(pipeline).await?;
        }
        Ok(StageOutcome::Finished)
    }
}

fn apply_completion(pipeline: &mut Pipeline, completion: TaskCompletion) {
    match completion.error {
        None => pipeline.finished_tasks += 1,
        Some(failure) => {
            warn!(
                "Task {}/{} ({}) of pipeline {} failed with {}: {}",
                completion.stage_index,
                completion.task_index,
                completion.plugin,
                pipeline.id,
                failure.name,
                failure.message
            );
            pipeline.record_failure(&failure.name);
        }
    }
}

fn transition(pipeline: &mut Pipeline, next: PipelineStatus) -> ServiceResult<()> {
    if !pipeline.status.can_transition_to(next) {
        return Err(ServiceError::validation(format!(
            "pipeline {} cannot move from {} to {}",
            pipeline.id, pipeline.status, next
        )));
    }
    pipeline.status = next;
    Ok(())
}
