//! Pipeline routes.

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
use super::blueprints::WaitQuery;
use super::error::{ApiResult, decode};
use crate::models::{NewPipeline, Pipeline};

/// Create the pipelines router
pub fn pipelines_router() -> Router<AppState> {
    Router::new()
        .route("/pipelines", get(list_pipelines).post(create_pipeline))
        .route("/pipelines/{pipeline_id}", get(get_pipeline))
        .route("/pipelines/{pipeline_id}/cancel", post(cancel_pipeline))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPipelinesQuery {
    #[serde(default)]
    blueprint_id: Option<i64>,
}

/// POST /pipelines?wait=true - run an explicit plan
async fn create_pipeline(
    State(state): State<AppState>,
    Query(query): Query<WaitQuery>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    let Json(body) = payload?;
    let new: NewPipeline = decode(body)?;
    let pipeline = if query.wait {
        state.pipelines.run_pipeline(new).await?
    } else {
        state.pipelines.submit_pipeline(new).await?
    };
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    Ok(Json(state.pipelines.list_pipelines(query.blueprint_id).await?))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<i64>,
) -> ApiResult<Json<Pipeline>> {
    Ok(Json(state.pipelines.get_pipeline(pipeline_id).await?))
}

async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(pipeline_id): Path<i64>,
) -> ApiResult<Json<Pipeline>> {
    Ok(Json(state.pipelines.cancel_pipeline(pipeline_id).await?))
}
