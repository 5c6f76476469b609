//! Tunables for a fetch.
//!
//! Every field has a default, so a JSON document only needs the keys it
//! overrides: `{"max_redirects": 5}` is a complete configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    /// Redirect hops followed before failing with `TooManyRedirects`.
    pub max_redirects: u32,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Credential candidates tried per challenge.
    pub max_auth_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("fetch-core/", env!("CARGO_PKG_VERSION")).to_string(),
            accept: "application/json, text/plain, */*".to_string(),
            accept_language: "en-US".to_string(),
            max_redirects: 10,
            connect_timeout_ms: 15_000,
            read_timeout_ms: 30_000,
            max_auth_attempts: 3,
        }
    }
}

impl FetchConfig {
    pub fn from_json(raw: &str) -> Result<Self, FetchError> {
        serde_json::from_str(raw).map_err(|e| FetchError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
