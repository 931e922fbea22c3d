use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const RESERVED_KEYS: [&str; 6] = [
    "id",
    "plugin",
    "connectionId",
    "name",
    "createdAt",
    "updatedAt",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationRule {
    pub id: i64,
    pub plugin: String,
    pub connection_id: i64,
    pub name: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated rule body produced by a plugin conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RulePayload {
    pub name: String,
    pub fields: Map<String, Value>,
}

impl RulePayload {
    pub fn from_value(raw: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = raw else {
            return Err("transformation rule payload must be a JSON object".to_string());
        };
        let name = match obj.remove("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            Some(Value::String(_)) | None => {
                return Err("transformation rule must have a name".to_string());
            }
            Some(_) => return Err("transformation rule name must be a string".to_string()),
        };
        for key in RESERVED_KEYS {
            obj.remove(key);
        }
        Ok(Self { name, fields: obj })
    }
}

impl TransformationRule {
    /// Top-level merge: supplied keys replace stored ones, absent keys are
    /// left untouched, `null` removes a key. Nested objects are replaced whole.
    pub fn merge_patch(&mut self, patch: Map<String, Value>, now: DateTime<Utc>) -> Result<(), String> {
        for (key, value) in patch {
            if key == "name" {
                match value {
                    Value::String(name) if !name.trim().is_empty() => self.name = name,
                    _ => return Err("transformation rule name must be a non-empty string".to_string()),
                }
                continue;
            }
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if value.is_null() {
                self.payload.remove(&key);
            } else {
                self.payload.insert(key, value);
            }
        }
        self.updated_at = now;
        Ok(())
    }
}
