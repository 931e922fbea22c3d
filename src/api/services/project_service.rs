use super::error::{ServiceError, ServiceResult};
use crate::models::{NewProject, Project, ProjectResponse};
use crate::storage::{StorageBackend, StorageError};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct ProjectService {
    storage: Arc<dyn StorageBackend>,
}

impl ProjectService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub async fn create(&self, new: NewProject) -> ServiceResult<Project> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(ServiceError::validation("project name must not be empty"));
        }
        let project = Project {
            name: name.to_string(),
            description: new.description,
            created_at: Utc::now(),
        };
        let created = self
            .storage
            .create_project(project)
            .await
            .map_err(|e| match e {
                StorageError::Conflict { message, .. } => ServiceError::ValidationFailed(message),
                other => other.into(),
            })?;
        info!("Created project {}", created.name);
        Ok(created)
    }

    /// A project with the blueprint bound to it.
    pub async fn get(&self, name: &str) -> ServiceResult<ProjectResponse> {
        let project = self
            .storage
            .get_project(name)
            .await?
            .ok_or_else(|| ServiceError::not_found("project", name))?;
        let blueprint = self.storage.get_blueprint_by_project(name).await?;
        Ok(ProjectResponse { project, blueprint })
    }

    pub async fn list(&self) -> ServiceResult<Vec<Project>> {
        Ok(self.storage.list_projects().await?)
    }
}
