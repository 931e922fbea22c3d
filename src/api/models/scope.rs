use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Keys owned by the registry; never stored inside the opaque payload.
const RESERVED_KEYS: [&str; 8] = [
    "id",
    "name",
    "plugin",
    "connectionId",
    "scopeId",
    "transformationRuleId",
    "createdAt",
    "updatedAt",
];

/// Natural key of an imported scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKey {
    pub plugin: String,
    pub connection_id: i64,
    pub scope_id: String,
}

impl ScopeKey {
    pub fn new(plugin: impl Into<String>, connection_id: i64, scope_id: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            connection_id,
            scope_id: scope_id.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.plugin, self.connection_id, self.scope_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub plugin: String,
    pub connection_id: i64,
    pub id: String,
    pub name: String,
    pub transformation_rule_id: Option<i64>,
    /// Plugin-defined fields (url, external identifiers, ...).
    #[serde(flatten)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scope {
    pub fn key(&self) -> ScopeKey {
        ScopeKey::new(self.plugin.clone(), self.connection_id, self.id.clone())
    }

    /// Build the record an upsert of `input` should store.
    ///
    /// An absent `transformationRuleId` keeps whatever `existing` references.
    /// Returns `existing` untouched when nothing would change.
    pub fn merge_input(
        existing: Option<&Scope>,
        plugin: &str,
        connection_id: i64,
        input: ScopeInput,
        now: DateTime<Utc>,
    ) -> Scope {
        let transformation_rule_id = match input.transformation_rule_id {
            Some(explicit) => explicit,
            None => existing.and_then(|s| s.transformation_rule_id),
        };
        if let Some(current) = existing {
            if current.name == input.name
                && current.transformation_rule_id == transformation_rule_id
                && current.data == input.data
            {
                return current.clone();
            }
        }
        Scope {
            plugin: plugin.to_string(),
            connection_id,
            id: input.id,
            name: input.name,
            transformation_rule_id,
            data: input.data,
            created_at: existing.map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        }
    }

    /// Apply a partial update. Supplied data fields replace stored ones.
    pub fn apply_patch(&mut self, patch: ScopePatch, now: DateTime<Utc>) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(rule) = patch.transformation_rule_id {
            self.transformation_rule_id = rule;
        }
        for (k, v) in strip_reserved(patch.data) {
            self.data.insert(k, v);
        }
        self.updated_at = now;
    }
}

/// A scope as submitted by a caller or produced by a plugin conversion.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInput {
    pub id: String,
    pub name: String,
    /// `None`: keep existing reference, `Some(None)`: clear, `Some(Some(id))`: set.
    #[serde(default, deserialize_with = "explicit_option")]
    pub transformation_rule_id: Option<Option<i64>>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ScopeInput {
    /// Parse a raw plugin entry. Numeric ids are accepted and stringified.
    pub fn from_value(raw: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = raw else {
            return Err("scope payload must be a JSON object".to_string());
        };
        if let Some(Value::Number(n)) = obj.get("id") {
            let id = n.to_string();
            obj.insert("id".to_string(), Value::String(id));
        }
        let input: ScopeInput =
            serde_json::from_value(Value::Object(obj)).map_err(|e| e.to_string())?;
        Ok(input.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.data = strip_reserved(self.data);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("scope id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err(format!("scope {} must have a name", self.id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "explicit_option")]
    pub transformation_rule_id: Option<Option<i64>>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Minimal reference to a blueprint that binds a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeResponse {
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformation_rule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blueprints: Option<Vec<BlueprintRef>>,
}

fn strip_reserved(mut data: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_KEYS {
        data.remove(key);
    }
    data
}

fn explicit_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
