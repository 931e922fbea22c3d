//! Process configuration.
//!
//! Values come from an optional YAML file named by `APP_CONFIG`, then from
//! environment variables, which win.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::services::DiscoverySettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    /// Postgres when set, SQLite otherwise.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// SQLite file; in-memory when unset.
    pub sqlite_path: Option<PathBuf>,
    pub discovery_timeout_secs: u64,
    pub discovery_max_pages: usize,
    pub rate_limit_per_minute: u32,
    /// Out-of-process plugins by name.
    pub remote_plugins: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            database_url: None,
            database_max_connections: 10,
            sqlite_path: None,
            discovery_timeout_secs: 30,
            discovery_max_pages: 100,
            rate_limit_per_minute: 600,
            remote_plugins: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from `APP_CONFIG` (if set) and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("APP_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = parse_var("PORT")? {
            self.port = port;
        }
        if let Some(url) = non_empty_var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(max) = parse_var("DATABASE_MAX_CONNECTIONS")? {
            self.database_max_connections = max;
        }
        if let Some(path) = non_empty_var("SQLITE_PATH") {
            self.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_var("DISCOVERY_TIMEOUT_SECS")? {
            self.discovery_timeout_secs = secs;
        }
        if let Some(pages) = parse_var("DISCOVERY_MAX_PAGES")? {
            self.discovery_max_pages = pages;
        }
        if let Some(rate) = parse_var("RATE_LIMIT_PER_MINUTE")? {
            self.rate_limit_per_minute = rate;
        }
        if let Some(raw) = non_empty_var("REMOTE_PLUGINS") {
            self.remote_plugins = parse_remote_plugins(&raw)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_timeout_secs == 0 {
            return Err(invalid("DISCOVERY_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.discovery_max_pages == 0 {
            return Err(invalid("DISCOVERY_MAX_PAGES", "must be greater than zero"));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(invalid("RATE_LIMIT_PER_MINUTE", "must be greater than zero"));
        }
        if self.database_max_connections == 0 {
            return Err(invalid("DATABASE_MAX_CONNECTIONS", "must be greater than zero"));
        }
        for (name, base) in &self.remote_plugins {
            url::Url::parse(base).map_err(|e| {
                invalid("REMOTE_PLUGINS", format!("plugin {} has a bad url {}: {}", name, base, e))
            })?;
        }
        Ok(())
    }

    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            timeout: Duration::from_secs(self.discovery_timeout_secs),
            max_pages: self.discovery_max_pages,
        }
    }
}

/// Parse `name=url,name=url`.
pub fn parse_remote_plugins(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut plugins = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, base) = entry
            .split_once('=')
            .map(|(n, u)| (n.trim(), u.trim()))
            .filter(|(n, u)| !n.is_empty() && !u.is_empty())
            .ok_or_else(|| invalid("REMOTE_PLUGINS", format!("expected name=url, got {}", entry)))?;
        plugins.insert(name.to_string(), base.to_string());
    }
    Ok(plugins)
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, format!("{}: {}", raw, e))),
        None => Ok(None),
    }
}
