//! Connection routes.

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
use crate::models::{Connection, ConnectionPatch, NewConnection};

/// Create the connections router
pub fn connections_router() -> Router<AppState> {
    Router::new()
        .route(
            "/plugins/{plugin}/connections",
            get(list_connections).post(create_connection),
        )
        .route(
            "/plugins/{plugin}/connections/{connection_id}",
            get(get_connection)
                .patch(update_connection)
                .delete(delete_connection),
        )
}

/// POST /plugins/{plugin}/connections
async fn create_connection(
    State(state): State<AppState>,
    Path(plugin): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Connection>)> {
    let Json(body) = payload?;
    let new: NewConnection = decode(body)?;
    let connection = state.connections.create(&plugin, new).await?;
    Ok((StatusCode::CREATED, Json(connection)))
}

/// GET /plugins/{plugin}/connections
async fn list_connections(
    State(state): State<AppState>,
    Path(plugin): Path<String>,
) -> ApiResult<Json<Vec<Connection>>> {
    Ok(Json(state.connections.list(&plugin).await?))
}

/// GET /plugins/{plugin}/connections/{connection_id}
async fn get_connection(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
) -> ApiResult<Json<Connection>> {
    Ok(Json(state.connections.get(&plugin, connection_id).await?))
}

/// PATCH /plugins/{plugin}/connections/{connection_id}
async fn update_connection(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Connection>> {
    let Json(body) = payload?;
    let patch: ConnectionPatch = decode(body)?;
    Ok(Json(
        state
            .connections
            .update(&plugin, connection_id, patch)
            .await?,
    ))
}

/// DELETE /plugins/{plugin}/connections/{connection_id} - 409 while scopes or rules remain
async fn delete_connection(
    State(state): State<AppState>,
    Path((plugin, connection_id)): Path<(String, i64)>,
) -> ApiResult<Json<Connection>> {
    Ok(Json(state.connections.delete(&plugin, connection_id).await?))
}
