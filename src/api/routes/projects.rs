//! Project routes.

use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde_json::Value;

use super::app_state::AppState;
use super::error::{ApiResult, decode};
use crate::models::{NewProject, Project, ProjectResponse};

/// Create the projects router
pub fn projects_router() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{name}", get(get_project))
}

async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let Json(body) = payload?;
    let new: NewProject = decode(body)?;
    Ok((StatusCode::CREATED, Json(state.projects.create(new).await?)))
}

async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.projects.list().await?))
}

/// GET /projects/{name} - the project and the blueprint bound to it
async fn get_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProjectResponse>> {
    Ok(Json(state.projects.get(&name).await?))
}
