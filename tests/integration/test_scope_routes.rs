//! Scope registry and scope deletion integration tests

use axum::http::StatusCode;
use axum_test::TestServer;
use pipeline_control_api::config::AppConfig;
use pipeline_control_api::plugins::{FakePlugin, PluginRegistry};
use pipeline_control_api::routes::{AppState, create_app};
use pipeline_control_api::storage::{SqliteStorageBackend, StorageBackend};
use serde_json::{Value, json};
use std::sync::Arc;

struct Fixture {
    server: TestServer,
    plugin: Arc<FakePlugin>,
    connection_id: i64,
}

impl Fixture {
    async fn new() -> Self {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorageBackend::in_memory().unwrap());
        let plugin = Arc::new(FakePlugin::with_projects(2));
        let plugins = PluginRegistry::new().with(plugin.clone());
        let state = AppState::new(storage, plugins, &AppConfig::default());
        let server = TestServer::new(create_app(state)).unwrap();
        let created = server
            .post("/api/v1/plugins/fake/connections")
            .json(&json!({"name": "c", "endpoint": "http://fake.org/api", "token": "t1"}))
            .await
            .json::<Value>();
        Self {
            server,
            plugin,
            connection_id: created["id"].as_i64().unwrap(),
        }
    }

    fn scopes(&self) -> String {
        format!(
            "/api/v1/plugins/fake/connections/{}/scopes",
            self.connection_id
        )
    }

    async fn put_scopes(&self, data: Value) -> Vec<Value> {
        let response = self.server.put(&self.scopes()).json(&json!({ "data": data })).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        response.json::<Vec<Value>>()
    }

    async fn blueprint(&self, name: &str, scope_ids: &[&str]) -> i64 {
        let scopes: Vec<Value> = scope_ids
            .iter()
            .map(|id| json!({"id": id, "entities": ["CICD"]}))
            .collect();
        let response = self
            .server
            .post("/api/v1/blueprints")
            .json(&json!({
                "name": name,
                "settings": {
                    "version": "2.0.0",
                    "connections": [{
                        "plugin": "fake",
                        "connectionId": self.connection_id,
                        "scopes": scopes,
                    }],
                },
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
        response.json::<Value>()["id"].as_i64().unwrap()
    }
}

fn project(id: &str) -> Value {
    json!({"id": id, "name": format!("Project {}", id), "url": format!("http://fake.org/api/project/{}", id)})
}

#[tokio::test]
async fn test_upsert_twice_is_idempotent() {
    let fx = Fixture::new().await;
    let first = fx.put_scopes(json!([project("p1")])).await;
    let second = fx.put_scopes(json!([project("p1")])).await;
    assert_eq!(first, second);

    let listed = fx.server.get(&fx.scopes()).await.json::<Vec<Value>>();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["scope"]["url"], "http://fake.org/api/project/p1");
}

#[tokio::test]
async fn test_upsert_keeps_rule_reference_unless_overwritten() {
    let fx = Fixture::new().await;
    let rule = fx
        .server
        .post(&format!(
            "/api/v1/plugins/fake/connections/{}/transformation_rules",
            fx.connection_id
        ))
        .json(&json!({"name": "Tx rule", "env": "test env"}))
        .await
        .json::<Value>();
    let rule_id = rule["id"].as_i64().unwrap();

    let mut with_rule = project("p1");
    with_rule["transformationRuleId"] = json!(rule_id);
    fx.put_scopes(json!([with_rule])).await;

    let renamed = json!({"id": "p1", "name": "Renamed"});
    let stored = fx.put_scopes(json!([renamed])).await;
    assert_eq!(stored[0]["transformationRuleId"], rule_id);
    assert_eq!(stored[0]["name"], "Renamed");

    let fetched = fx
        .server
        .get(&format!("{}/p1", fx.scopes()))
        .await
        .json::<Value>();
    assert_eq!(fetched["transformationRuleName"], "Tx rule");

    let cleared = fx
        .put_scopes(json!([{"id": "p1", "name": "Renamed", "transformationRuleId": null}]))
        .await;
    assert!(cleared[0]["transformationRuleId"].is_null());
}

#[tokio::test]
async fn test_upsert_rejects_unknown_rule_and_writes_nothing() {
    let fx = Fixture::new().await;
    let mut bad = project("p2");
    bad["transformationRuleId"] = json!(999);
    let response = fx
        .server
        .put(&fx.scopes())
        .json(&json!({"data": [project("p1"), bad]}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let listed = fx.server.get(&fx.scopes()).await.json::<Vec<Value>>();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_patch_scope_name() {
    let fx = Fixture::new().await;
    fx.put_scopes(json!([project("p1")])).await;
    let response = fx
        .server
        .patch(&format!("{}/p1", fx.scopes()))
        .json(&json!({"name": "Patched"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let patched = response.json::<Value>();
    assert_eq!(patched["name"], "Patched");
    assert_eq!(patched["url"], "http://fake.org/api/project/p1");
}

#[tokio::test]
async fn test_list_with_blueprint_refs() {
    let fx = Fixture::new().await;
    fx.put_scopes(json!([project("p1"), project("p2")])).await;
    let blueprint_id = fx.blueprint("bp", &["p1"]).await;

    let listed = fx
        .server
        .get(&fx.scopes())
        .add_query_param("blueprints", "true")
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["blueprints"][0]["id"], blueprint_id);
    assert_eq!(listed[1]["blueprints"], json!([]));

    let plain = fx.server.get(&fx.scopes()).await.json::<Vec<Value>>();
    assert!(plain[0].get("blueprints").is_none());
}

#[tokio::test]
async fn test_delete_detaches_scope_from_blueprints() {
    let fx = Fixture::new().await;
    fx.put_scopes(json!([project("p1"), project("p2")])).await;
    let both = fx.blueprint("both", &["p1", "p2"]).await;
    let only = fx.blueprint("only", &["p1"]).await;

    let response = fx.server.delete(&format!("{}/p1", fx.scopes())).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let mut affected: Vec<i64> = response.json::<Value>()["blueprintIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    affected.sort();
    assert_eq!(affected, vec![both, only]);

    let listed = fx
        .server
        .get(&fx.scopes())
        .add_query_param("blueprints", "true")
        .await
        .json::<Vec<Value>>();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["scope"]["id"], "p2");

    let both_bp = fx
        .server
        .get(&format!("/api/v1/blueprints/{}", both))
        .await
        .json::<Value>();
    let bound = &both_bp["settings"]["connections"][0]["scopes"];
    assert_eq!(bound.as_array().unwrap().len(), 1);
    assert_eq!(bound[0]["id"], "p2");
    assert_eq!(both_bp["enable"], true);

    let only_bp = fx
        .server
        .get(&format!("/api/v1/blueprints/{}", only))
        .await
        .json::<Value>();
    assert_eq!(only_bp["enable"], false);
    assert_eq!(only_bp["settings"]["connections"], json!([]));

    assert_eq!(fx.plugin.purged(), vec!["p1".to_string()]);
}

#[tokio::test]
async fn test_delete_data_only_keeps_scope_and_bindings() {
    let fx = Fixture::new().await;
    fx.put_scopes(json!([project("p1")])).await;
    let blueprint_id = fx.blueprint("bp", &["p1"]).await;

    let response = fx
        .server
        .delete(&format!("{}/p1", fx.scopes()))
        .add_query_param("delete_data_only", "true")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["blueprintIds"], json!([blueprint_id]));

    let fetched = fx.server.get(&format!("{}/p1", fx.scopes())).await;
    assert_eq!(fetched.status_code(), StatusCode::OK);
    let bp = fx
        .server
        .get(&format!("/api/v1/blueprints/{}", blueprint_id))
        .await
        .json::<Value>();
    assert_eq!(bp["settings"]["connections"][0]["scopes"][0]["id"], "p1");
    assert_eq!(fx.plugin.purged(), vec!["p1".to_string()]);
}

#[tokio::test]
async fn test_blocking_delete_of_referenced_scope_conflicts() {
    let fx = Fixture::new().await;
    fx.put_scopes(json!([project("p1")])).await;
    fx.blueprint("bp", &["p1"]).await;

    let response = fx
        .server
        .delete(&format!("{}/p1", fx.scopes()))
        .add_query_param("block", "true")
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["code"], "ScopeInUse");
    assert!(fx.plugin.purged().is_empty());
}

#[tokio::test]
async fn test_missing_scope_is_not_found() {
    let fx = Fixture::new().await;
    let response = fx.server.get(&format!("{}/nope", fx.scopes())).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let response = fx.server.delete(&format!("{}/nope", fx.scopes())).await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
