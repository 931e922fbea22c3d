use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A credential binding between a plugin and one external account/instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: i64,
    pub plugin: String,
    pub name: String,
    pub endpoint: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_hour: Option<u32>,
    /// Plugin-specific credential fields the core never interprets.
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnection {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl NewConnection {
    pub fn into_connection(self, plugin: &str, now: DateTime<Utc>) -> Connection {
        Connection {
            id: 0,
            plugin: plugin.to_string(),
            name: self.name,
            endpoint: self.endpoint,
            token: self.token,
            proxy: self.proxy,
            rate_limit_per_hour: self.rate_limit_per_hour,
            extra: self.extra,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(default)]
    pub extra: Option<Map<String, Value>>,
}

impl Connection {
    /// Apply a patch in place. Identity (`id`, `plugin`) never changes.
    pub fn apply_patch(&mut self, patch: ConnectionPatch, now: DateTime<Utc>) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(endpoint) = patch.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(token) = patch.token {
            self.token = token;
        }
        if patch.proxy.is_some() {
            self.proxy = patch.proxy;
        }
        if patch.rate_limit_per_hour.is_some() {
            self.rate_limit_per_hour = patch.rate_limit_per_hour;
        }
        if let Some(extra) = patch.extra {
            for (k, v) in extra {
                self.extra.insert(k, v);
            }
        }
        self.updated_at = now;
    }
}
