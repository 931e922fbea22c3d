//! Plugin proxied to an out-of-process plugin service over HTTP.
//!
//! The service exposes `POST {base}/remote-scopes`, `POST {base}/tasks` and
//! `POST {base}/purge`. Every request carries the connection's bearer token.

use super::{Plugin, PluginError, RemoteScopeLister, ScopeConvertible, TaskContext, TaskExecutor};
use crate::models::{Connection, RemoteScopePage, Scope, TaskFailure};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection fields forwarded to the plugin service.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionPayload<'a> {
    id: i64,
    name: &'a str,
    endpoint: &'a str,
    proxy: Option<&'a str>,
    rate_limit_per_hour: Option<u32>,
    extra: &'a Map<String, Value>,
}

impl<'a> From<&'a Connection> for ConnectionPayload<'a> {
    fn from(c: &'a Connection) -> Self {
        Self {
            id: c.id,
            name: &c.name,
            endpoint: &c.endpoint,
            proxy: c.proxy.as_deref(),
            rate_limit_per_hour: c.rate_limit_per_hour,
            extra: &c.extra,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRequest<'a> {
    connection: ConnectionPayload<'a>,
    group_id: Option<&'a str>,
    page_token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PurgeRequest<'a> {
    connection: ConnectionPayload<'a>,
    scope: &'a Scope,
}

pub struct HttpRemotePlugin {
    name: String,
    base_url: Url,
    client: reqwest::Client,
}

impl HttpRemotePlugin {
    pub fn new(name: impl Into<String>, base_url: &str) -> Result<Self, PluginError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| PluginError::Configuration(format!("invalid base url {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PluginError::Configuration(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            base_url,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, PluginError> {
        self.base_url
            .join(path)
            .map_err(|e| PluginError::Configuration(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<reqwest::Response, PluginError> {
        let url = self.endpoint(path)?;
        debug!("POST {} via plugin {}", url, self.name);
        let mut request = self.client.post(url).json(body);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }
}

async fn upstream_error(response: reqwest::Response) -> PluginError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    PluginError::Upstream(format!("plugin service returned {}: {}", status, body))
}

#[async_trait]
impl RemoteScopeLister for HttpRemotePlugin {
    async fn list_groups(
        &self,
        connection: &Connection,
        group_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<RemoteScopePage, PluginError> {
        let body = ListRequest {
            connection: connection.into(),
            group_id,
            page_token,
        };
        let response = self.post("remote-scopes", &connection.token, &body).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(PluginError::NotFound(
                group_id.unwrap_or_default().to_string(),
            )),
            status if status.is_success() => Ok(response.json::<RemoteScopePage>().await?),
            _ => Err(upstream_error(response).await),
        }
    }
}

impl ScopeConvertible for HttpRemotePlugin {}

#[async_trait]
impl TaskExecutor for HttpRemotePlugin {
    async fn execute(&self, context: TaskContext) -> Result<(), TaskFailure> {
        let token = context
            .connection
            .as_ref()
            .map(|c| c.token.clone())
            .unwrap_or_default();
        let response = self
            .post("tasks", &token, &context)
            .await
            .map_err(|e| TaskFailure::new("PluginUnavailable", e.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(serde_json::from_str::<TaskFailure>(&text)
            .unwrap_or_else(|_| TaskFailure::new("RemoteTaskFailed", format!("{}: {}", status, text))))
    }
}

#[async_trait]
impl Plugin for HttpRemotePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purge_scope_data(
        &self,
        connection: &Connection,
        scope: &Scope,
    ) -> Result<(), PluginError> {
        let body = PurgeRequest {
            connection: connection.into(),
            scope,
        };
        let response = self.post("purge", &connection.token, &body).await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(upstream_error(response).await)
        }
    }
}
