use super::enums::{BlueprintMode, DomainEntity};
use super::plan::{PersistedPlan, PipelinePlan, PlanDecodeError};
use super::scope::ScopeKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SETTINGS_VERSION_V200: &str = "2.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintScope {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entities: Vec<DomainEntity>,
}

impl BlueprintScope {
    /// An empty entity list requests every entity family.
    pub fn effective_entities(&self) -> Vec<DomainEntity> {
        if self.entities.is_empty() {
            return DomainEntity::ALL.to_vec();
        }
        let mut entities = self.entities.clone();
        entities.sort();
        entities.dedup();
        entities
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintConnection {
    pub plugin: String,
    pub connection_id: i64,
    #[serde(default)]
    pub scopes: Vec<BlueprintScope>,
}

/// Scope bindings of a NORMAL-mode blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSettings {
    pub version: String,
    #[serde(default)]
    pub connections: Vec<BlueprintConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_plan: Option<PipelinePlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_plan: Option<PipelinePlan>,
}

impl BlueprintSettings {
    pub fn v200(connections: Vec<BlueprintConnection>) -> Self {
        Self {
            version: SETTINGS_VERSION_V200.to_string(),
            connections,
            before_plan: None,
            after_plan: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.version != SETTINGS_VERSION_V200 {
            return Err(format!(
                "unsupported blueprint settings version: {}",
                self.version
            ));
        }
        for conn in &self.connections {
            let mut seen = std::collections::HashSet::new();
            for scope in &conn.scopes {
                if scope.id.trim().is_empty() {
                    return Err(format!(
                        "connection {} of plugin {} binds a scope with an empty id",
                        conn.connection_id, conn.plugin
                    ));
                }
                if !seen.insert(scope.id.as_str()) {
                    return Err(format!("scope {} is bound twice", scope.id));
                }
            }
        }
        Ok(())
    }

    pub fn scope_keys(&self) -> Vec<ScopeKey> {
        self.connections
            .iter()
            .flat_map(|c| {
                c.scopes
                    .iter()
                    .map(|s| ScopeKey::new(c.plugin.clone(), c.connection_id, s.id.clone()))
            })
            .collect()
    }

    /// Scopes named by tasks of the before and after plans.
    pub fn hook_scope_keys(&self) -> Vec<ScopeKey> {
        let mut keys: Vec<ScopeKey> = self
            .hook_plans()
            .flat_map(PipelinePlan::scope_keys)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Distinct (plugin, connection) pairs: bindings first, then hook tasks.
    pub fn connection_keys(&self) -> Vec<(String, i64)> {
        let mut keys: Vec<(String, i64)> = Vec::new();
        let bound = self.connections.iter().map(|c| (c.plugin.clone(), c.connection_id));
        let hooked = self
            .hook_scope_keys()
            .into_iter()
            .map(|k| (k.plugin, k.connection_id));
        for key in bound.chain(hooked) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn hook_plans(&self) -> impl Iterator<Item = &PipelinePlan> {
        self.before_plan.iter().chain(self.after_plan.iter())
    }

    /// Remove the binding of `key`. Connections left without scopes are dropped.
    pub fn detach_scope(&mut self, key: &ScopeKey) -> bool {
        let mut removed = false;
        for conn in &mut self.connections {
            if conn.plugin == key.plugin && conn.connection_id == key.connection_id {
                let before = conn.scopes.len();
                conn.scopes.retain(|s| s.id != key.scope_id);
                removed |= before != conn.scopes.len();
            }
        }
        self.connections.retain(|c| !c.scopes.is_empty());
        for plan in [&mut self.before_plan, &mut self.after_plan] {
            if let Some(hook) = plan.as_mut() {
                removed |= hook.remove_scope_tasks(key);
                if hook.stages().is_empty() {
                    *plan = None;
                }
            }
        }
        removed
    }

    pub fn has_scopes(&self) -> bool {
        self.connections.iter().any(|c| !c.scopes.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub id: i64,
    pub name: String,
    pub project_name: Option<String>,
    pub mode: BlueprintMode,
    pub enable: bool,
    pub cron_config: String,
    pub is_manual: bool,
    pub skip_on_fail: bool,
    pub settings: Option<BlueprintSettings>,
    pub plan: PersistedPlan,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Blueprint {
    pub fn unmarshal_plan(&self) -> Result<PipelinePlan, PlanDecodeError> {
        self.plan.decode()
    }

    /// Every scope this blueprint depends on; this is what the index stores.
    pub fn referenced_scopes(&self) -> Vec<ScopeKey> {
        let mut keys = match (&self.mode, &self.settings) {
            (BlueprintMode::Normal, Some(settings)) => {
                let mut keys = settings.scope_keys();
                keys.extend(settings.hook_scope_keys());
                keys
            }
            _ => self
                .unmarshal_plan()
                .map(|p| p.scope_keys())
                .unwrap_or_default(),
        };
        keys.sort();
        keys.dedup();
        keys
    }

    /// Detach `key` from settings and the persisted plan. A blueprint left
    /// with no bound scope is disabled, never deleted.
    pub fn detach_scope(&mut self, key: &ScopeKey, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        let mut has_scopes = false;
        if let Some(settings) = self.settings.as_mut() {
            changed |= settings.detach_scope(key);
            has_scopes = settings.has_scopes();
        }
        if let Ok(mut plan) = self.plan.decode() {
            if plan.remove_scope_tasks(key) {
                changed = true;
                self.plan = PersistedPlan::encode(self.plan.version, &plan);
            }
            if self.mode == BlueprintMode::Advanced {
                has_scopes = !plan.scope_keys().is_empty();
            }
        }
        if changed {
            if !has_scopes {
                self.enable = false;
            }
            self.updated_at = now;
        }
        changed
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlueprint {
    pub name: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: BlueprintMode,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub cron_config: String,
    #[serde(default = "default_true")]
    pub is_manual: bool,
    #[serde(default)]
    pub skip_on_fail: bool,
    #[serde(default)]
    pub settings: Option<BlueprintSettings>,
    /// Hand-written plan for ADVANCED mode.
    #[serde(default)]
    pub plan: Option<PipelinePlan>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub enable: Option<bool>,
    #[serde(default)]
    pub cron_config: Option<String>,
    #[serde(default)]
    pub is_manual: Option<bool>,
    #[serde(default)]
    pub skip_on_fail: Option<bool>,
    #[serde(default)]
    pub settings: Option<BlueprintSettings>,
    #[serde(default)]
    pub plan: Option<PipelinePlan>,
}

fn default_mode() -> BlueprintMode {
    BlueprintMode::Normal
}

fn default_true() -> bool {
    true
}
