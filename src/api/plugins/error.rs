//! Errors raised by plugin capability calls.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// The requested remote group does not exist upstream
    #[error("remote group not found: {0}")]
    NotFound(String),
    /// The upstream API or plugin service failed
    #[error("upstream call failed: {0}")]
    Upstream(String),
    /// The plugin returned or was given a payload it cannot use
    #[error("invalid plugin payload: {0}")]
    InvalidPayload(String),
    #[error("plugin call timed out after {0:?}")]
    Timeout(Duration),
    #[error("plugin misconfigured: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for PluginError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            PluginError::InvalidPayload(e.to_string())
        } else {
            PluginError::Upstream(e.to_string())
        }
    }
}
