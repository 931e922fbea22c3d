//! Transformation rule routes.

use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde_json::{Map, Value};

use super::app_state::AppState;
use super::error::{ApiResult, decode};
use crate::models::TransformationRule;

/// Create the transformation rules router
pub fn transformation_rules_router() -> Router<AppState> {
    Router::new()
        .route(
            "/plugins/{plugin}/connections/{connection_id}/transformation_rules",
            get(list_rules).post(create_rule),
        )
        .route(
            "/plugins/{plugin}/connections/{connection_id}/transformation_rules/{rule_id}",
            get(get_rule).patch(patch_rule).delete(delete_rule),
        )
}

async fn create_rule(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TransformationRule>)> {
    let Json(body) = payload?;
    let rule = state.rules.create(&plugin, connection_id, body).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_rules(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
) -> ApiResult<Json<Vec<TransformationRule>>> {
    Ok(Json(state.rules.list(&plugin, connection_id).await?))
}

async fn get_rule(
    State(state): State<AppState>,
    Path((plugin, connection_id, rule_id)): Path<(String, i64, i64)>,
) -> ApiResult<Json<TransformationRule>> {
    Ok(Json(state.rules.get(&plugin, connection_id, rule_id).await?))
}

/// PATCH merges top-level fields; `null` removes a field.
async fn patch_rule(
    State(state): State<AppState>,
    Path((plugin, connection_id, rule_id)): Path<(String, i64, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<TransformationRule>> {
    let Json(body) = payload?;
    let patch: Map<String, Value> = decode(body)?;
    Ok(Json(
        state
            .rules
            .patch(&plugin, connection_id, rule_id, patch)
            .await?,
    ))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path((plugin, connection_id, rule_id)): Path<(String, i64, i64)>,
) -> ApiResult<Json<TransformationRule>> {
    Ok(Json(
        state.rules.delete(&plugin, connection_id, rule_id).await?,
    ))
}
