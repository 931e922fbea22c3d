//! Out-of-process plugin tests against a stub plugin service

use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router, routing::post};
use axum_test::TestServer;
use pipeline_control_api::config::AppConfig;
use pipeline_control_api::plugins::{HttpRemotePlugin, PluginRegistry};
use pipeline_control_api::routes::{AppState, create_app};
use pipeline_control_api::storage::{SqliteStorageBackend, StorageBackend};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Stub {
    tasks: Arc<Mutex<Vec<Value>>>,
    purged: Arc<Mutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "Bearer t1")
        .unwrap_or(false)
}

async fn spawn_stub() -> (String, Stub) {
    let stub = Stub::default();
    let tasks = stub.tasks.clone();
    let purged = stub.purged.clone();
    let app = Router::new()
        .route(
            "/remote-scopes",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                if !authorized(&headers) {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
                }
                match body["groupId"].as_str() {
                    None => (
                        StatusCode::OK,
                        Json(json!({"entries": [{"id": "org", "name": "Org", "type": "group"}]})),
                    ),
                    Some("org") => (
                        StatusCode::OK,
                        Json(json!({"entries": [{
                            "id": "repo1",
                            "name": "Repo 1",
                            "type": "scope",
                            "data": {"id": "repo1", "name": "Repo 1", "url": "http://remote/repo1"},
                        }]})),
                    ),
                    Some(_) => (StatusCode::NOT_FOUND, Json(json!({}))),
                }
            }),
        )
        .route(
            "/tasks",
            post(move |Json(body): Json<Value>| {
                let tasks = tasks.clone();
                async move {
                    let fail = body["task"]["options"]["fail"].as_bool().unwrap_or(false);
                    tasks.lock().unwrap().push(body);
                    if fail {
                        (
                            StatusCode::UNPROCESSABLE_ENTITY,
                            Json(json!({"name": "RemoteBoom", "message": "asked to"})),
                        )
                    } else {
                        (StatusCode::OK, Json(json!({})))
                    }
                }
            }),
        )
        .route(
            "/purge",
            post(move |Json(body): Json<Value>| {
                let purged = purged.clone();
                async move {
                    purged.lock().unwrap().push(body);
                    StatusCode::OK
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/", addr), stub)
}

async fn setup() -> (TestServer, Stub, String, i64) {
    let (base_url, stub) = spawn_stub().await;
    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorageBackend::in_memory().unwrap());
    let plugins =
        PluginRegistry::new().with(Arc::new(HttpRemotePlugin::new("remote", &base_url).unwrap()));
    let server =
        TestServer::new(create_app(AppState::new(storage, plugins, &AppConfig::default()))).unwrap();
    let connection = server
        .post("/api/v1/plugins/remote/connections")
        .json(&json!({"name": "c", "endpoint": "http://remote/api", "token": "t1"}))
        .await
        .json::<Value>();
    let id = connection["id"].as_i64().unwrap();
    (
        server,
        stub,
        format!("/api/v1/plugins/remote/connections/{}", id),
        id,
    )
}

#[tokio::test]
async fn test_remote_listing_is_normalized() {
    let (server, _stub, base, _) = setup().await;
    let root = server
        .get(&format!("{}/remote-scopes", base))
        .await
        .json::<Value>();
    assert_eq!(root["children"][0]["id"], "org");
    assert!(root["children"][0]["parentId"].is_null());

    let org = server
        .get(&format!("{}/remote-scopes", base))
        .add_query_param("groupId", "org")
        .await
        .json::<Value>();
    assert_eq!(org["children"][0]["parentId"], "org");
    assert_eq!(org["children"][0]["data"]["url"], "http://remote/repo1");

    let response = server
        .get(&format!("{}/remote-scopes", base))
        .add_query_param("groupId", "nope")
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_token_is_discovery_failure() {
    let (server, _stub, base, _) = setup().await;
    server
        .patch(&base)
        .json(&json!({"token": "wrong"}))
        .await;
    let response = server.get(&format!("{}/remote-scopes", base)).await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.json::<Value>()["code"], "DiscoveryFailed");
}

#[tokio::test]
async fn test_tasks_are_forwarded_with_rehydrated_scope() {
    let (server, stub, base, connection_id) = setup().await;
    server
        .post(&format!("{}/remote-scopes/import", base))
        .json(&json!({"groupId": "org", "scopeIds": ["repo1"]}))
        .await;

    let plan = json!([[
        {"plugin": "remote", "options": {"connectionId": connection_id, "scopeId": "repo1", "entities": ["CODE"]}},
        {"plugin": "remote", "options": {"connectionId": connection_id, "scopeId": "repo1", "fail": true}},
    ]]);
    let pipeline = server
        .post("/api/v1/pipelines")
        .add_query_param("wait", "true")
        .json(&json!({"name": "remote", "plan": plan, "skipOnFail": true}))
        .await
        .json::<Value>();
    assert_eq!(pipeline["status"], "TASK_FAILED");
    assert_eq!(pipeline["finishedTasks"], 1);
    assert_eq!(pipeline["errorName"], "RemoteBoom");

    let tasks = stub.tasks.lock().unwrap().clone();
    assert_eq!(tasks.len(), 2);
    let ok = tasks
        .iter()
        .find(|t| t["task"]["options"].get("fail").is_none())
        .unwrap();
    assert_eq!(ok["scope"]["url"], "http://remote/repo1");
    assert_eq!(ok["entities"], json!(["CODE"]));
}

#[tokio::test]
async fn test_scope_delete_calls_purge() {
    let (server, stub, base, _) = setup().await;
    server
        .post(&format!("{}/remote-scopes/import", base))
        .json(&json!({"groupId": "org", "scopeIds": ["repo1"]}))
        .await;
    let response = server.delete(&format!("{}/scopes/repo1", base)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let purged = stub.purged.lock().unwrap().clone();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0]["scope"]["id"], "repo1");
}
