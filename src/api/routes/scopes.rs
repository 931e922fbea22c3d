//! Scope registry routes.

use axum::{
    Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    response::Json,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::app_state::AppState;
use super::error::{ApiResult, decode};
use crate::models::{Scope, ScopePatch, ScopeResponse};
use crate::services::DeleteScopeOptions;

/// Create the scopes router
pub fn scopes_router() -> Router<AppState> {
    Router::new()
        .route(
            "/plugins/{plugin}/connections/{connection_id}/scopes",
            get(list_scopes).put(put_scopes),
        )
        .route(
            "/plugins/{plugin}/connections/{connection_id}/scopes/{scope_id}",
            get(get_scope).patch(patch_scope).delete(delete_scope),
        )
}

#[derive(Debug, Deserialize)]
pub struct PutScopesRequest {
    data: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListScopesQuery {
    #[serde(default)]
    blueprints: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteScopeQuery {
    #[serde(default)]
    delete_data_only: bool,
    #[serde(default)]
    block: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteScopeResponse {
    blueprint_ids: Vec<i64>,
}

/// PUT /plugins/{plugin}/connections/{connection_id}/scopes - upsert `{ "data": [...] }`
async fn put_scopes(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Vec<Scope>>> {
    let Json(body) = payload?;
    let request: PutScopesRequest = decode(body)?;
    let scopes = state
        .scopes
        .upsert_raw(&plugin, connection_id, request.data)
        .await?;
    info!(
        "[Scopes Route] Upserted {} scopes on {} connection {}",
        scopes.len(),
        plugin,
        connection_id
    );
    Ok(Json(scopes))
}

/// GET /plugins/{plugin}/connections/{connection_id}/scopes?blueprints=true
async fn list_scopes(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
    Query(query): Query<ListScopesQuery>,
) -> ApiResult<Json<Vec<ScopeResponse>>> {
    Ok(Json(
        state
            .scopes
            .list(&plugin, connection_id, query.blueprints)
            .await?,
    ))
}

/// GET /plugins/{plugin}/connections/{connection_id}/scopes/{scope_id}
async fn get_scope(
    State(state): State<AppState>,
    Path((plugin, connection_id, scope_id)): Path<(String, i64, String)>,
) -> ApiResult<Json<ScopeResponse>> {
    Ok(Json(
        state.scopes.get(&plugin, connection_id, &scope_id).await?,
    ))
}

/// PATCH /plugins/{plugin}/connections/{connection_id}/scopes/{scope_id}
async fn patch_scope(
    State(state): State<AppState>,
    Path((plugin, connection_id, scope_id)): Path<(String, i64, String)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Scope>> {
    let Json(body) = payload?;
    let patch: ScopePatch = decode(body)?;
    Ok(Json(
        state
            .scopes
            .patch(&plugin, connection_id, &scope_id, patch)
            .await?,
    ))
}

/// DELETE /plugins/{plugin}/connections/{connection_id}/scopes/{scope_id}?delete_data_only=&block=
async fn delete_scope(
    State(state): State<AppState>,
    Path((plugin, connection_id, scope_id)): Path<(String, i64, String)>,
    Query(query): Query<DeleteScopeQuery>,
) -> ApiResult<Json<DeleteScopeResponse>> {
    let options = DeleteScopeOptions {
        delete_data_only: query.delete_data_only,
        block_if_referenced: query.block,
    };
    let blueprint_ids = state
        .scopes
        .delete(&plugin, connection_id, &scope_id, options)
        .await?;
    Ok(Json(DeleteScopeResponse { blueprint_ids }))
}
