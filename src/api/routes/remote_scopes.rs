//! Remote scope discovery routes.

use axum::{
    Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use super::app_state::AppState;
use super::error::{ApiResult, decode};
use crate::models::{RemoteScopesOutput, Scope};

/// Create the remote scopes router
pub fn remote_scopes_router() -> Router<AppState> {
    Router::new()
        .route(
            "/plugins/{plugin}/connections/{connection_id}/remote-scopes",
            get(list_remote_scopes),
        )
        .route(
            "/plugins/{plugin}/connections/{connection_id}/remote-scopes/import",
            post(import_remote_scopes),
        )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteScopesQuery {
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    page_token: Option<String>,
    /// Drain every page instead of returning one.
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRemoteScopesRequest {
    #[serde(default)]
    group_id: Option<String>,
    scope_ids: Vec<String>,
}

/// GET /plugins/{plugin}/connections/{connection_id}/remote-scopes?groupId=&pageToken=
async fn list_remote_scopes(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
    Query(query): Query<RemoteScopesQuery>,
) -> ApiResult<Json<RemoteScopesOutput>> {
    let group_id = query.group_id.as_deref();
    if query.all {
        let children = state
            .remote_scopes
            .list_children(&plugin, connection_id, group_id)
            .await?;
        return Ok(Json(RemoteScopesOutput {
            children,
            next_page_token: None,
        }));
    }
    Ok(Json(
        state
            .remote_scopes
            .list_page(&plugin, connection_id, group_id, query.page_token.as_deref())
            .await?,
    ))
}

/// POST /plugins/{plugin}/connections/{connection_id}/remote-scopes/import
async fn import_remote_scopes(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Vec<Scope>>> {
    let Json(body) = payload?;
    let request: ImportRemoteScopesRequest = decode(body)?;
    Ok(Json(
        state
            .remote_scopes
            .import_remote_scopes(
                &plugin,
                connection_id,
                request.group_id.as_deref(),
                &request.scope_ids,
            )
            .await?,
    ))
}
