//! Blueprint routes.

use axum::{
    Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use super::app_state::AppState;
use super::error::{ApiResult, decode};
use crate::models::{Blueprint, BlueprintPatch, NewBlueprint, Pipeline};

/// Create the blueprints router
pub fn blueprints_router() -> Router<AppState> {
    Router::new()
        .route("/blueprints", get(list_blueprints).post(create_blueprint))
        .route(
            "/blueprints/{blueprint_id}",
            get(get_blueprint)
                .patch(update_blueprint)
                .delete(delete_blueprint),
        )
        .route("/blueprints/{blueprint_id}/trigger", post(trigger_blueprint))
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    /// Block until the pipeline reaches a terminal status.
    #[serde(default)]
    pub wait: bool,
}

/// POST /blueprints - compiled before anything is stored
async fn create_blueprint(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Blueprint>)> {
    let Json(body) = payload?;
    let new: NewBlueprint = decode(body)?;
    Ok((StatusCode::CREATED, Json(state.blueprints.create(new).await?)))
}

async fn list_blueprints(State(state): State<AppState>) -> ApiResult<Json<Vec<Blueprint>>> {
    Ok(Json(state.blueprints.list().await?))
}

async fn get_blueprint(
    State(state): State<AppState>,
    Path(blueprint_id): Path<i64>,
) -> ApiResult<Json<Blueprint>> {
    Ok(Json(state.blueprints.get(blueprint_id).await?))
}

async fn update_blueprint(
    State(state): State<AppState>,
    Path(blueprint_id): Path<i64>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Blueprint>> {
    let Json(body) = payload?;
    let patch: BlueprintPatch = decode(body)?;
    Ok(Json(state.blueprints.update(blueprint_id, patch).await?))
}

async fn delete_blueprint(
    State(state): State<AppState>,
    Path(blueprint_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.blueprints.delete(blueprint_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /blueprints/{blueprint_id}/trigger?wait=true
async fn trigger_blueprint(
    State(state): State<AppState>,
    Path(blueprint_id): Path<i64>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<Pipeline>> {
    Ok(Json(state.blueprints.trigger(blueprint_id, query.wait).await?))
}
