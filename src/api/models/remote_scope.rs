//! Remote scope hierarchy as seen through a plugin.

use super::enums::ScopeGroupType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw entry as returned by a plugin's remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ScopeGroupType,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RemoteEntry {
    pub fn group(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ScopeGroupType::Group,
            data: None,
        }
    }

    pub fn scope(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ScopeGroupType::Scope,
            data: Some(data),
        }
    }
}

/// One page of a plugin's remote listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteScopePage {
    pub entries: Vec<RemoteEntry>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// A normalized node in the remote hierarchy.
///
/// `data` is only present for `scope` nodes; `parent_id` is `None` at the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGroup {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ScopeGroupType,
    pub parent_id: Option<String>,
    pub data: Option<Value>,
}

impl ScopeGroup {
    pub fn from_entry(entry: RemoteEntry, parent_id: Option<&str>) -> Self {
        let data = match entry.kind {
            ScopeGroupType::Group => None,
            ScopeGroupType::Scope => Some(entry.data.unwrap_or_else(|| Value::Object(Map::new()))),
        };
        Self {
            id: entry.id,
            name: entry.name,
            kind: entry.kind,
            parent_id: parent_id.map(str::to_string),
            data,
        }
    }

    pub fn is_scope(&self) -> bool {
        self.kind == ScopeGroupType::Scope
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteScopesOutput {
    pub children: Vec<ScopeGroup>,
    pub next_page_token: Option<String>,
}
