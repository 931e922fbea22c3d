//! End-to-end blueprint workflow tests

use axum::http::StatusCode;
use axum_test::TestServer;
use pipeline_control_api::config::AppConfig;
use pipeline_control_api::plugins::{FakePlugin, PluginRegistry};
use pipeline_control_api::routes::{AppState, create_app};
use pipeline_control_api::storage::{SqliteStorageBackend, StorageBackend};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn server_with(plugin: Arc<FakePlugin>) -> TestServer {
    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorageBackend::in_memory().unwrap());
    let plugins = PluginRegistry::new().with(plugin);
    TestServer::new(create_app(AppState::new(storage, plugins, &AppConfig::default()))).unwrap()
}

async fn create_connection(server: &TestServer) -> i64 {
    let created = server
        .post("/api/v1/plugins/fake/connections")
        .json(&json!({"name": "c", "endpoint": "http://fake.org/api", "token": "t1"}))
        .await
        .json::<Value>();
    created["id"].as_i64().unwrap()
}

fn settings(connection_id: i64, scopes: Value) -> Value {
    json!({
        "version": "2.0.0",
        "connections": [{"plugin": "fake", "connectionId": connection_id, "scopes": scopes}],
    })
}

#[tokio::test]
async fn test_end_to_end_pipeline_completes() {
    let plugin = Arc::new(FakePlugin::new());
    let server = server_with(plugin.clone());
    let connection_id = create_connection(&server).await;
    let base = format!("/api/v1/plugins/fake/connections/{}", connection_id);

    let imported = server
        .post(&format!("{}/remote-scopes/import", base))
        .json(&json!({"groupId": "group1", "scopeIds": ["p1"]}))
        .await;
    assert_eq!(imported.status_code(), StatusCode::OK);

    let rule = server
        .post(&format!("{}/transformation_rules", base))
        .json(&json!({"name": "Tx rule", "env": "test env"}))
        .await
        .json::<Value>();
    let response = server
        .patch(&format!("{}/scopes/p1", base))
        .json(&json!({"transformationRuleId": rule["id"]}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({
            "name": "e2e",
            "settings": settings(connection_id, json!([{"id": "p1", "entities": ["CICD"]}])),
        }))
        .await;
    assert_eq!(blueprint.status_code(), StatusCode::CREATED);
    let blueprint = blueprint.json::<Value>();
    let stages = &blueprint["plan"]["body"]["stages"];
    assert_eq!(stages.as_array().unwrap().len(), 1);
    let options = &stages[0][0]["options"];
    assert_eq!(options["connectionId"], connection_id);
    assert_eq!(options["scopeId"], "p1");
    assert_eq!(options["entities"], json!(["CICD"]));
    assert_eq!(options["transformationRuleId"], rule["id"]);

    let response = server
        .post(&format!("/api/v1/blueprints/{}/trigger", blueprint["id"]))
        .add_query_param("wait", "true")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let pipeline = response.json::<Value>();
    assert_eq!(pipeline["status"], "TASK_COMPLETED");
    assert_eq!(pipeline["finishedTasks"], 1);
    assert_eq!(pipeline["errorName"], "");
    assert_eq!(pipeline["blueprintId"], blueprint["id"]);

    let executed = plugin.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].scope_id.as_deref(), Some("p1"));
    assert_eq!(
        executed[0].scope_url.as_deref(),
        Some("http://fake.org/api/project/p1")
    );
    assert_eq!(executed[0].transformation_rule.as_deref(), Some("Tx rule"));
    assert_eq!(executed[0].entities, vec!["CICD".to_string()]);
}

#[tokio::test]
async fn test_compile_with_missing_scope_persists_nothing() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;

    let response = server
        .post("/api/v1/blueprints")
        .json(&json!({
            "name": "broken",
            "settings": settings(connection_id, json!([{"id": "ghost"}])),
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body = response.json::<Value>();
    assert_eq!(body["code"], "ScopeNotFound");
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    let blueprints = server.get("/api/v1/blueprints").await.json::<Vec<Value>>();
    assert!(blueprints.is_empty());
}

#[tokio::test]
async fn test_trigger_after_scope_deleted_out_of_band_fails_compile() {
    let server = server_with(Arc::new(FakePlugin::with_projects(2)));
    let connection_id = create_connection(&server).await;
    let base = format!("/api/v1/plugins/fake/connections/{}", connection_id);
    server
        .put(&format!("{}/scopes", base))
        .json(&json!({"data": [{"id": "p1", "name": "one"}, {"id": "p2", "name": "two"}]}))
        .await;
    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({
            "name": "bp",
            "settings": settings(connection_id, json!([{"id": "p1"}, {"id": "p2"}])),
        }))
        .await
        .json::<Value>();

    // Removing p1 detaches it, so the blueprint still compiles with p2 alone.
    server.delete(&format!("{}/scopes/p1", base)).await;
    let pipeline = server
        .post(&format!("/api/v1/blueprints/{}/trigger", blueprint["id"]))
        .add_query_param("wait", "true")
        .await
        .json::<Value>();
    assert_eq!(pipeline["status"], "TASK_COMPLETED");
    assert_eq!(pipeline["totalTasks"], 1);
}

#[tokio::test]
async fn test_disabled_blueprint_cannot_be_triggered() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    let base = format!("/api/v1/plugins/fake/connections/{}", connection_id);
    server
        .put(&format!("{}/scopes", base))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "bp", "settings": settings(connection_id, json!([{"id": "p1"}]))}))
        .await
        .json::<Value>();
    server.delete(&format!("{}/scopes/p1", base)).await;

    let response = server
        .post(&format!("/api/v1/blueprints/{}/trigger", blueprint["id"]))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_empty_entities_expand_to_all() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    server
        .put(&format!("/api/v1/plugins/fake/connections/{}/scopes", connection_id))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "all", "settings": settings(connection_id, json!([{"id": "p1"}]))}))
        .await
        .json::<Value>();
    let entities = &blueprint["plan"]["body"]["stages"][0][0]["options"]["entities"];
    assert_eq!(entities.as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_unknown_entity_is_rejected() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    let response = server
        .post("/api/v1/blueprints")
        .json(&json!({
            "name": "bad",
            "settings": settings(connection_id, json!([{"id": "p1", "entities": ["WIKI"]}])),
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_before_and_after_plans_wrap_collection_stage() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    server
        .put(&format!("/api/v1/plugins/fake/connections/{}/scopes", connection_id))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let mut blueprint_settings = settings(connection_id, json!([{"id": "p1"}]));
    blueprint_settings["beforePlan"] = json!([[{"plugin": "fake", "options": {"step": "before"}}]]);
    blueprint_settings["afterPlan"] = json!([[{"plugin": "fake", "options": {"step": "after"}}]]);
    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "wrapped", "settings": blueprint_settings}))
        .await
        .json::<Value>();
    let stages = blueprint["plan"]["body"]["stages"].as_array().unwrap().clone();
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[0][0]["options"]["step"], "before");
    assert_eq!(stages[1][0]["options"]["scopeId"], "p1");
    assert_eq!(stages[2][0]["options"]["step"], "after");
}

#[tokio::test]
async fn test_hook_task_with_missing_scope_fails_compile() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    server
        .put(&format!("/api/v1/plugins/fake/connections/{}/scopes", connection_id))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let mut blueprint_settings = settings(connection_id, json!([{"id": "p1"}]));
    blueprint_settings["beforePlan"] = json!([[{
        "plugin": "fake",
        "options": {"connectionId": connection_id, "scopeId": "ghost"},
    }]]);
    let response = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "ghostly", "settings": blueprint_settings}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body = response.json::<Value>();
    assert_eq!(body["code"], "ScopeNotFound");
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    let blueprints = server.get("/api/v1/blueprints").await.json::<Vec<Value>>();
    assert!(blueprints.is_empty());
}

#[tokio::test]
async fn test_advanced_blueprint_keeps_its_plan() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    server
        .put(&format!("/api/v1/plugins/fake/connections/{}/scopes", connection_id))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let plan = json!([[{
        "plugin": "fake",
        "subtasks": ["collect"],
        "options": {"connectionId": connection_id, "scopeId": "p1"},
    }]]);
    let response = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "adv", "mode": "ADVANCED", "plan": plan}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let blueprint = response.json::<Value>();
    assert_eq!(blueprint["plan"]["body"]["stages"][0][0]["subtasks"], json!(["collect"]));

    let missing = json!([[{"plugin": "fake", "options": {"connectionId": connection_id, "scopeId": "zz"}}]]);
    let response = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "adv2", "mode": "ADVANCED", "plan": missing}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_project_binds_one_blueprint() {
    let server = server_with(Arc::new(FakePlugin::new()));
    let connection_id = create_connection(&server).await;
    server
        .put(&format!("/api/v1/plugins/fake/connections/{}/scopes", connection_id))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let response = server
        .post("/api/v1/projects")
        .json(&json!({"name": "proj", "description": "demo"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let body = json!({
        "name": "bp",
        "projectName": "proj",
        "settings": settings(connection_id, json!([{"id": "p1"}])),
    });
    let blueprint = server.post("/api/v1/blueprints").json(&body).await.json::<Value>();

    let project = server.get("/api/v1/projects/proj").await.json::<Value>();
    assert_eq!(project["name"], "proj");
    assert_eq!(project["blueprint"]["id"], blueprint["id"]);

    let mut second = body.clone();
    second["name"] = json!("bp2");
    let response = server.post("/api/v1/blueprints").json(&second).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server.get("/api/v1/projects/other").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_and_delete_blueprint() {
    let server = server_with(Arc::new(FakePlugin::with_projects(2)));
    let connection_id = create_connection(&server).await;
    let base = format!("/api/v1/plugins/fake/connections/{}", connection_id);
    server
        .put(&format!("{}/scopes", base))
        .json(&json!({"data": [{"id": "p1", "name": "one"}, {"id": "p2", "name": "two"}]}))
        .await;
    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "bp", "settings": settings(connection_id, json!([{"id": "p1"}]))}))
        .await
        .json::<Value>();
    let path = format!("/api/v1/blueprints/{}", blueprint["id"]);

    let updated = server
        .patch(&path)
        .json(&json!({"settings": settings(connection_id, json!([{"id": "p2"}]))}))
        .await
        .json::<Value>();
    assert_eq!(updated["plan"]["body"]["stages"][0][0]["options"]["scopeId"], "p2");

    let scopes = server
        .get(&format!("{}/scopes", base))
        .add_query_param("blueprints", "true")
        .await
        .json::<Vec<Value>>();
    assert_eq!(scopes[0]["blueprints"], json!([]));
    assert_eq!(scopes[1]["blueprints"][0]["id"], blueprint["id"]);

    assert_eq!(server.delete(&path).await.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(server.get(&path).await.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_trigger_without_wait_returns_pending_pipeline() {
    let plugin = Arc::new(FakePlugin::new().with_task_delay(Duration::from_millis(50)));
    let server = server_with(plugin);
    let connection_id = create_connection(&server).await;
    server
        .put(&format!("/api/v1/plugins/fake/connections/{}/scopes", connection_id))
        .json(&json!({"data": [{"id": "p1", "name": "one"}]}))
        .await;
    let blueprint = server
        .post("/api/v1/blueprints")
        .json(&json!({"name": "bg", "settings": settings(connection_id, json!([{"id": "p1"}]))}))
        .await
        .json::<Value>();

    let pipeline = server
        .post(&format!("/api/v1/blueprints/{}/trigger", blueprint["id"]))
        .await
        .json::<Value>();
    assert_eq!(pipeline["status"], "TASK_CREATED");

    let path = format!("/api/v1/pipelines/{}", pipeline["id"]);
    let mut status = String::new();
    for _ in 0..100 {
        status = server.get(&path).await.json::<Value>()["status"]
            .as_str()
            .unwrap()
            .to_string();
        if status == "TASK_COMPLETED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "TASK_COMPLETED");

    let listed = server
        .get("/api/v1/pipelines")
        .add_query_param("blueprintId", blueprint["id"].to_string())
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed.len(), 1);
}
