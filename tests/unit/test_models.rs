//! Unit tests for the domain models

use chrono::{Duration, Utc};
use pipeline_control_api::models::{
    Blueprint, BlueprintConnection, BlueprintMode, BlueprintScope, BlueprintSettings,
    DomainEntity, NewPipeline, PersistedPlan, Pipeline, PipelinePlan, PipelineStatus,
    PipelineTask, PlanVersion, Scope, ScopeGroupType, ScopeInput, ScopeKey, ScopePatch,
};
use serde_json::{Map, json};
use std::str::FromStr;

fn task(scope: &str) -> PipelineTask {
    let mut options = Map::new();
    options.insert("connectionId".into(), json!(1));
    options.insert("scopeId".into(), json!(scope));
    PipelineTask {
        plugin: "fake".into(),
        subtasks: None,
        options,
    }
}

fn blueprint(mode: BlueprintMode, settings: Option<BlueprintSettings>, plan: PipelinePlan) -> Blueprint {
    let now = Utc::now() - Duration::minutes(1);
    Blueprint {
        id: 1,
        name: "bp".into(),
        project_name: None,
        mode,
        enable: true,
        cron_config: String::new(),
        is_manual: true,
        skip_on_fail: false,
        settings,
        plan: PersistedPlan::encode(PlanVersion::V200, &plan),
        created_at: now,
        updated_at: now,
    }
}

fn scope_binding(id: &str) -> BlueprintScope {
    BlueprintScope {
        id: id.into(),
        name: String::new(),
        entities: vec![],
    }
}

#[test]
fn test_domain_entity_names() {
    assert_eq!(DomainEntity::from_str("CODEREVIEW").unwrap(), DomainEntity::CodeReview);
    assert!(DomainEntity::from_str("code").is_err());
    assert_eq!(serde_json::to_value(DomainEntity::Cicd).unwrap(), json!("CICD"));
    let parsed: Vec<DomainEntity> = serde_json::from_value(json!(["TICKET", "CROSS"])).unwrap();
    assert_eq!(parsed, vec![DomainEntity::Ticket, DomainEntity::Cross]);
    for entity in DomainEntity::ALL {
        assert_eq!(DomainEntity::from_str(&entity.to_string()).unwrap(), entity);
    }
}

#[test]
fn test_enum_wire_names() {
    assert_eq!(serde_json::to_value(ScopeGroupType::Group).unwrap(), json!("group"));
    assert_eq!(serde_json::to_value(BlueprintMode::Advanced).unwrap(), json!("ADVANCED"));
    assert_eq!(BlueprintMode::from_str("NORMAL").unwrap(), BlueprintMode::Normal);
    assert_eq!(
        serde_json::to_value(PipelineStatus::Cancelled).unwrap(),
        json!("TASK_CANCELLED")
    );
    assert_eq!(PipelineStatus::from_str("TASK_RUNNING").unwrap(), PipelineStatus::Running);
    assert!(PipelineStatus::from_str("RUNNING").is_err());
}

#[test]
fn test_status_transitions_only_move_forward() {
    use PipelineStatus::*;
    assert!(Created.can_transition_to(Running));
    assert!(Created.can_transition_to(Cancelled));
    assert!(!Created.can_transition_to(Completed));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(Running.can_transition_to(Cancelled));
    assert!(!Running.can_transition_to(Created));
    for terminal in [Completed, Failed, Cancelled] {
        assert!(terminal.is_terminal());
        for next in [Created, Running, Completed, Failed, Cancelled] {
            assert!(!terminal.can_transition_to(next));
        }
    }
}

#[test]
fn test_pending_pipeline_counts_tasks() {
    let new = NewPipeline {
        name: "p".into(),
        plan: PipelinePlan::new(vec![vec![task("a"), task("b")], vec![task("c")]]),
        skip_on_fail: true,
        blueprint_id: Some(3),
    };
    let mut pipeline = Pipeline::pending(new, Utc::now());
    assert_eq!(pipeline.status, PipelineStatus::Created);
    assert_eq!(pipeline.total_tasks, 3);
    assert_eq!(pipeline.error_name, "");

    pipeline.record_failure("First");
    pipeline.record_failure("Second");
    assert_eq!(pipeline.failed_tasks, 2);
    assert_eq!(pipeline.error_name, "First");
}

#[test]
fn test_scope_patch_keeps_unspecified_fields() {
    let then = Utc::now() - Duration::minutes(5);
    let input = ScopeInput::from_value(json!({
        "id": "p1", "name": "P", "transformationRuleId": 2, "url": "u", "branch": "main"
    }))
    .unwrap();
    let mut scope = Scope::merge_input(None, "fake", 1, input, then);

    let patch: ScopePatch = serde_json::from_value(json!({"branch": "dev", "id": "other"})).unwrap();
    scope.apply_patch(patch, Utc::now());
    assert_eq!(scope.id, "p1");
    assert_eq!(scope.name, "P");
    assert_eq!(scope.transformation_rule_id, Some(2));
    assert_eq!(scope.data["branch"], json!("dev"));
    assert_eq!(scope.data["url"], json!("u"));
    assert!(scope.updated_at > then);

    let clear: ScopePatch = serde_json::from_value(json!({"transformationRuleId": null})).unwrap();
    scope.apply_patch(clear, Utc::now());
    assert_eq!(scope.transformation_rule_id, None);
}

#[test]
fn test_scope_input_rejects_non_objects_and_blank_names() {
    assert!(ScopeInput::from_value(json!(["p1"])).is_err());
    let blank = ScopeInput::from_value(json!({"id": "p1", "name": " "})).unwrap();
    assert!(blank.validate().is_err());
    let empty_id = ScopeInput::from_value(json!({"id": "", "name": "P"})).unwrap();
    assert!(empty_id.validate().is_err());
}

#[test]
fn test_scope_serializes_payload_flat() {
    let input = ScopeInput::from_value(json!({"id": "p1", "name": "P", "url": "u"})).unwrap();
    let scope = Scope::merge_input(None, "fake", 4, input, Utc::now());
    let value = serde_json::to_value(&scope).unwrap();
    assert_eq!(value["url"], "u");
    assert_eq!(value["connectionId"], 4);
    assert!(value["transformationRuleId"].is_null());
}

#[test]
fn test_effective_entities() {
    let mut binding = scope_binding("p1");
    assert_eq!(binding.effective_entities(), DomainEntity::ALL.to_vec());
    binding.entities = vec![DomainEntity::Cicd, DomainEntity::Code, DomainEntity::Cicd];
    assert_eq!(
        binding.effective_entities(),
        vec![DomainEntity::Code, DomainEntity::Cicd]
    );
}

#[test]
fn test_settings_validation() {
    let mut settings = BlueprintSettings::v200(vec![BlueprintConnection {
        plugin: "fake".into(),
        connection_id: 1,
        scopes: vec![scope_binding("p1"), scope_binding("p1")],
    }]);
    assert!(settings.validate().is_err());

    settings.connections[0].scopes.pop();
    assert!(settings.validate().is_ok());

    settings.version = "1.0.0".into();
    assert!(settings.validate().is_err());
}

#[test]
fn test_connection_keys_are_distinct_in_order() {
    let settings = BlueprintSettings::v200(vec![
        BlueprintConnection {
            plugin: "b".into(),
            connection_id: 2,
            scopes: vec![scope_binding("x")],
        },
        BlueprintConnection {
            plugin: "a".into(),
            connection_id: 1,
            scopes: vec![scope_binding("y")],
        },
        BlueprintConnection {
            plugin: "b".into(),
            connection_id: 2,
            scopes: vec![scope_binding("z")],
        },
    ]);
    assert_eq!(
        settings.connection_keys(),
        vec![("b".to_string(), 2), ("a".to_string(), 1)]
    );
}

#[test]
fn test_normal_blueprint_detach_disables_when_empty() {
    let settings = BlueprintSettings::v200(vec![BlueprintConnection {
        plugin: "fake".into(),
        connection_id: 1,
        scopes: vec![scope_binding("p1"), scope_binding("p2")],
    }]);
    let plan = PipelinePlan::new(vec![vec![task("p1"), task("p2")]]);
    let mut bp = blueprint(BlueprintMode::Normal, Some(settings), plan);
    assert_eq!(bp.referenced_scopes().len(), 2);

    assert!(bp.detach_scope(&ScopeKey::new("fake", 1, "p1"), Utc::now()));
    assert!(bp.enable);
    assert_eq!(bp.referenced_scopes(), vec![ScopeKey::new("fake", 1, "p2")]);
    assert_eq!(bp.unmarshal_plan().unwrap().task_count(), 1);

    assert!(bp.detach_scope(&ScopeKey::new("fake", 1, "p2"), Utc::now()));
    assert!(!bp.enable);
    assert!(bp.referenced_scopes().is_empty());

    let before = bp.updated_at;
    assert!(!bp.detach_scope(&ScopeKey::new("fake", 1, "p2"), Utc::now()));
    assert_eq!(bp.updated_at, before);
}

#[test]
fn test_advanced_blueprint_references_come_from_plan() {
    let plan = PipelinePlan::new(vec![vec![task("p1")], vec![task("p1"), task("p2")]]);
    let mut bp = blueprint(BlueprintMode::Advanced, None, plan);
    assert_eq!(
        bp.referenced_scopes(),
        vec![ScopeKey::new("fake", 1, "p1"), ScopeKey::new("fake", 1, "p2")]
    );

    assert!(bp.detach_scope(&ScopeKey::new("fake", 1, "p1"), Utc::now()));
    assert!(bp.enable);
    let plan = bp.unmarshal_plan().unwrap();
    assert_eq!(plan.stages().len(), 1);
    assert_eq!(plan.task_count(), 1);
}
