//! Unit tests for the SQLite storage backend

use chrono::Utc;
use pipeline_control_api::models::{
    Blueprint, BlueprintConnection, BlueprintMode, BlueprintScope, BlueprintSettings, Connection,
    NewPipeline, PersistedPlan, Pipeline, PipelinePlan, PipelineStatus, PlanVersion, Project,
    Scope, ScopeKey, TransformationRule,
};
use pipeline_control_api::storage::{
    ConnectionDependents, Deletion, SqliteStorageBackend, StorageBackend, StorageError,
};
use serde_json::{Map, json};
use tempfile::TempDir;

fn connection(name: &str) -> Connection {
    let now = Utc::now();
    Connection {
        id: 0,
        plugin: "fake".into(),
        name: name.into(),
        endpoint: "http://fake.org/api/".into(),
        token: "secret".into(),
        proxy: Some("http://proxy:3128".into()),
        rate_limit_per_hour: None,
        extra: Map::new(),
        created_at: now,
        updated_at: now,
    }
}

fn scope(connection_id: i64, id: &str) -> Scope {
    let now = Utc::now();
    let mut data = Map::new();
    data.insert("url".into(), json!(format!("http://fake.org/api/project/{}", id)));
    Scope {
        plugin: "fake".into(),
        connection_id,
        id: id.into(),
        name: id.to_uppercase(),
        transformation_rule_id: None,
        data,
        created_at: now,
        updated_at: now,
    }
}

fn blueprint(name: &str, connection_id: i64, scope_ids: &[&str]) -> Blueprint {
    let now = Utc::now();
    Blueprint {
        id: 0,
        name: name.into(),
        project_name: None,
        mode: BlueprintMode::Normal,
        enable: true,
        cron_config: "0 0 * * *".into(),
        is_manual: false,
        skip_on_fail: true,
        settings: Some(BlueprintSettings::v200(vec![BlueprintConnection {
            plugin: "fake".into(),
            connection_id,
            scopes: scope_ids
                .iter()
                .map(|id| BlueprintScope {
                    id: id.to_string(),
                    name: String::new(),
                    entities: vec![],
                })
                .collect(),
        }])),
        plan: PersistedPlan::encode(PlanVersion::V200, &PipelinePlan::default()),
        created_at: now,
        updated_at: now,
    }
}

fn pipeline(blueprint_id: Option<i64>) -> Pipeline {
    Pipeline::pending(
        NewPipeline {
            name: "run".into(),
            plan: PipelinePlan::default(),
            skip_on_fail: false,
            blueprint_id,
        },
        Utc::now(),
    )
}

#[tokio::test]
async fn test_file_backed_storage_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("control.db");

    let (conn_id, bp_id) = {
        let store = SqliteStorageBackend::open(&path).unwrap();
        let conn = store.create_connection(connection("c1")).await.unwrap();
        store.upsert_scopes(&[scope(conn.id, "p1")]).await.unwrap();
        let bp = store
            .create_blueprint(blueprint("bp", conn.id, &["p1"]))
            .await
            .unwrap();
        (conn.id, bp.id)
    };

    let store = SqliteStorageBackend::open(&path).unwrap();
    let conn = store.get_connection("fake", conn_id).await.unwrap().unwrap();
    assert_eq!(conn.token, "secret");
    assert_eq!(conn.proxy.as_deref(), Some("http://proxy:3128"));
    let stored = store
        .get_scope(&ScopeKey::new("fake", conn_id, "p1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.data["url"], json!("http://fake.org/api/project/p1"));
    let bp = store.get_blueprint(bp_id).await.unwrap().unwrap();
    assert_eq!(bp.cron_config, "0 0 * * *");
    assert!(bp.skip_on_fail);
    let refs = store
        .blueprints_referencing(&ScopeKey::new("fake", conn_id, "p1"))
        .await
        .unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "bp");
}

#[tokio::test]
async fn test_update_blueprint_rewrites_scope_index() {
    let store = SqliteStorageBackend::in_memory().unwrap();
    let conn = store.create_connection(connection("c1")).await.unwrap();
    store
        .upsert_scopes(&[scope(conn.id, "p1"), scope(conn.id, "p2")])
        .await
        .unwrap();
    let mut bp = store
        .create_blueprint(blueprint("bp", conn.id, &["p1"]))
        .await
        .unwrap();

    bp.settings = blueprint("bp", conn.id, &["p2"]).settings;
    store.update_blueprint(&bp).await.unwrap();

    assert!(store
        .blueprints_referencing(&ScopeKey::new("fake", conn.id, "p1"))
        .await
        .unwrap()
        .is_empty());
    let refs = store.scope_blueprint_refs("fake", conn.id).await.unwrap();
    assert_eq!(refs.get("p2").map(Vec::len), Some(1));
    assert!(!refs.contains_key("p1"));

    assert!(store.delete_blueprint(bp.id).await.unwrap());
    assert!(!store.delete_blueprint(bp.id).await.unwrap());
    assert!(store.scope_blueprint_refs("fake", conn.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_listings_keep_insertion_order() {
    let store = SqliteStorageBackend::in_memory().unwrap();
    for name in ["zeta", "alpha", "mid"] {
        store.create_connection(connection(name)).await.unwrap();
    }
    let names: Vec<String> = store
        .list_connections("fake")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    assert!(store.list_connections("other").await.unwrap().is_empty());

    let conn_id = store.list_connections("fake").await.unwrap()[0].id;
    store
        .upsert_scopes(&[scope(conn_id, "b"), scope(conn_id, "a")])
        .await
        .unwrap();
    store.upsert_scopes(&[scope(conn_id, "b")]).await.unwrap();
    let ids: Vec<String> = store
        .list_scopes("fake", conn_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["b", "a"]);
}

#[tokio::test]
async fn test_rules_are_scoped_to_their_connection() {
    let store = SqliteStorageBackend::in_memory().unwrap();
    let c1 = store.create_connection(connection("c1")).await.unwrap();
    let c2 = store.create_connection(connection("c2")).await.unwrap();
    let now = Utc::now();
    let mut payload = Map::new();
    payload.insert("deploymentPattern".into(), json!("deploy"));
    let rule = store
        .create_rule(TransformationRule {
            id: 0,
            plugin: "fake".into(),
            connection_id: c1.id,
            name: "rule".into(),
            payload,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    assert!(store.get_rule("fake", c2.id, rule.id).await.unwrap().is_none());
    let fetched = store.get_rule("fake", c1.id, rule.id).await.unwrap().unwrap();
    assert_eq!(fetched.payload["deploymentPattern"], json!("deploy"));

    let outcome = store.delete_connection("fake", c1.id).await.unwrap();
    assert_eq!(
        outcome,
        Deletion::InUse(ConnectionDependents { scopes: 0, rules: 1 })
    );
    assert_eq!(store.delete_connection("fake", c2.id).await.unwrap(), Deletion::Deleted);
    assert_eq!(store.delete_connection("fake", c2.id).await.unwrap(), Deletion::NotFound);
}

#[tokio::test]
async fn test_terminal_pipelines_are_not_overwritten() {
    let store = SqliteStorageBackend::in_memory().unwrap();
    let mut p = store.create_pipeline(pipeline(None)).await.unwrap();
    assert!(p.id > 0);

    p.status = PipelineStatus::Running;
    p.began_at = Some(Utc::now());
    store.update_pipeline(&p).await.unwrap();
    p.status = PipelineStatus::Completed;
    p.finished_at = Some(Utc::now());
    store.update_pipeline(&p).await.unwrap();

    p.status = PipelineStatus::Failed;
    let err = store.update_pipeline(&p).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict { .. }));
    let stored = store.get_pipeline(p.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PipelineStatus::Completed);
    assert!(stored.finished_at.is_some());

    p.id += 100;
    let err = store.update_pipeline(&p).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn test_pipelines_filter_by_blueprint() {
    let store = SqliteStorageBackend::in_memory().unwrap();
    let conn = store.create_connection(connection("c1")).await.unwrap();
    store.upsert_scopes(&[scope(conn.id, "p1")]).await.unwrap();
    let bp = store
        .create_blueprint(blueprint("bp", conn.id, &["p1"]))
        .await
        .unwrap();
    let first = store.create_pipeline(pipeline(Some(bp.id))).await.unwrap();
    store.create_pipeline(pipeline(None)).await.unwrap();
    let second = store.create_pipeline(pipeline(Some(bp.id))).await.unwrap();

    let ids: Vec<i64> = store
        .list_pipelines(Some(bp.id))
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert_eq!(store.list_pipelines(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_project_binding_is_unique() {
    let store = SqliteStorageBackend::in_memory().unwrap();
    store
        .create_project(Project {
            name: "proj".into(),
            description: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let conn = store.create_connection(connection("c1")).await.unwrap();
    store.upsert_scopes(&[scope(conn.id, "p1")]).await.unwrap();

    let mut first = blueprint("first", conn.id, &["p1"]);
    first.project_name = Some("proj".into());
    let first = store.create_blueprint(first).await.unwrap();
    let mut second = blueprint("second", conn.id, &["p1"]);
    second.project_name = Some("proj".into());
    assert!(matches!(
        store.create_blueprint(second).await.unwrap_err(),
        StorageError::Conflict { .. }
    ));
    let bound = store.get_blueprint_by_project("proj").await.unwrap().unwrap();
    assert_eq!(bound.id, first.id);
}
