//! Connection route integration tests

use axum::http::StatusCode;
use axum_test::TestServer;
use pipeline_control_api::routes::{AppState, create_app};
use serde_json::{Value, json};

const CONNECTIONS: &str = "/api/v1/plugins/fake/connections";

fn server() -> TestServer {
    let state = AppState::in_memory().unwrap();
    TestServer::new(create_app(state)).unwrap()
}

async fn create_connection(server: &TestServer, name: &str, token: &str) -> Value {
    let response = server
        .post(CONNECTIONS)
        .json(&json!({
            "name": name,
            "endpoint": "http://fake.org/api",
            "token": token,
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json::<Value>()
}

#[tokio::test]
async fn test_health_check() {
    let response = server().get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["status"], "ok");
}

#[tokio::test]
async fn test_create_then_list_has_one_entry_with_token() {
    let server = server();
    let created = create_connection(&server, "conn one", "t1").await;
    assert_eq!(created["token"], "t1");
    assert_eq!(created["plugin"], "fake");

    let response = server.get(CONNECTIONS).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let list = response.json::<Vec<Value>>();
    let matching: Vec<&Value> = list.iter().filter(|c| c["token"] == "t1").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0]["id"], created["id"]);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let server = server();
    create_connection(&server, "dup", "t1").await;
    let response = server
        .post(CONNECTIONS)
        .json(&json!({"name": "dup", "endpoint": "http://fake.org/api"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["code"], "ValidationFailed");
}

#[tokio::test]
async fn test_invalid_endpoint_is_rejected() {
    let response = server()
        .post(CONNECTIONS)
        .json(&json!({"name": "bad", "endpoint": "not a url"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_body_is_validation_failure() {
    let response = server()
        .post(CONNECTIONS)
        .json(&json!({"endpoint": "http://fake.org/api"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body = response.json::<Value>();
    assert_eq!(body["code"], "ValidationFailed");
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn test_unknown_plugin_is_not_found() {
    let response = server().get("/api/v1/plugins/nope/connections").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["code"], "NotFound");
}

#[tokio::test]
async fn test_patch_updates_token_only() {
    let server = server();
    let created = create_connection(&server, "patchable", "t1").await;
    let id = created["id"].as_i64().unwrap();

    let response = server
        .patch(&format!("{}/{}", CONNECTIONS, id))
        .json(&json!({"token": "t2"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let patched = response.json::<Value>();
    assert_eq!(patched["token"], "t2");
    assert_eq!(patched["name"], "patchable");

    let fetched = server.get(&format!("{}/{}", CONNECTIONS, id)).await.json::<Value>();
    assert_eq!(fetched["token"], "t2");
}

#[tokio::test]
async fn test_delete_blocked_while_scopes_remain() {
    let server = server();
    let created = create_connection(&server, "busy", "t1").await;
    let id = created["id"].as_i64().unwrap();
    let scopes = format!("{}/{}/scopes", CONNECTIONS, id);
    let response = server
        .put(&scopes)
        .json(&json!({"data": [{"id": "p1", "name": "Project 1"}]}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server.delete(&format!("{}/{}", CONNECTIONS, id)).await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["code"], "ConnectionInUse");

    server.delete(&format!("{}/p1", scopes)).await;
    let response = server.delete(&format!("{}/{}", CONNECTIONS, id)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let response = server.get(&format!("{}/{}", CONNECTIONS, id)).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
