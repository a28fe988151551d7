//! Typed view of the `server.json` configuration document.
//!
//! Only the keys the core acts on are modeled; everything else is preserved
//! verbatim in [`ServerConfig::extra`] so handler code can reach it through
//! the server context.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root of the configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub web: WebSection,
    /// Keys the core does not recognize, passed through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub request: RequestConfig,
}

/// `server.restart` — any combination of the three keys may coexist.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RestartConfig {
    /// Minutes between automatic restarts; installs a period restart timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// Wall-clock times (`HH:MM`) at which to restart.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<String>,
    /// Cron expressions (five-field or `@shortcut`) at which to restart.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crons: Vec<String>,
}

impl RestartConfig {
    pub fn is_empty(&self) -> bool {
        self.period.is_none() && self.times.is_empty() && self.crons.is_empty()
    }
}

/// `server.request` — per-request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    /// Hard per-request timeout in seconds, applied as the socket read
    /// timeout while a request is being parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Maximum accepted body size in bytes.
    #[serde(default = "default_body_size")]
    pub body_size: u64,
}

fn default_body_size() -> u64 {
    // 100 MiB, matching the original server's default upload ceiling.
    104_857_600
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            body_size: default_body_size(),
        }
    }
}

impl RequestConfig {
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebSection {
    #[serde(default)]
    pub r#static: StaticConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub cache: StaticCacheConfig,
    /// File names served when a static route resolves to a directory.
    #[serde(default = "default_static_defaults")]
    pub defaults: Vec<String>,
}

fn default_static_defaults() -> Vec<String> {
    vec!["index.html".to_string()]
}

/// `web.static.cache` — emitted as `Cache-Control: max-age=` on static
/// responses when enabled.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticCacheConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_max_age")]
    pub max_age: u64,
}

fn default_max_age() -> u64 {
    3600
}

impl Default for StaticCacheConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_age: default_max_age(),
        }
    }
}

impl ServerConfig {
    /// Load a configuration document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Parse a configuration document from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    /// Look up a passthrough value by dotted path, e.g. `"mail.from"`.
    pub fn get_extra(&self, dotted: &str) -> Option<&Value> {
        let mut parts = dotted.split('.');
        let mut current = self.extra.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_restart_section() {
        let cfg = ServerConfig::from_json(
            r#"{ "server": { "restart": { "period": 180, "crons": ["@minutely"] } } }"#,
        )
        .unwrap();
        assert_eq!(cfg.server.restart.period, Some(180));
        assert_eq!(cfg.server.restart.crons, vec!["@minutely"]);
        assert!(cfg.server.restart.times.is_empty());
    }

    #[test]
    fn defaults_when_sections_absent() {
        let cfg = ServerConfig::from_json("{}").unwrap();
        assert!(cfg.server.restart.is_empty());
        assert_eq!(cfg.server.request.body_size, 104_857_600);
        assert!(!cfg.web.r#static.cache.enable);
        assert_eq!(cfg.web.r#static.defaults, vec!["index.html"]);
    }

    #[test]
    fn preserves_unknown_keys() {
        let cfg = ServerConfig::from_json(
            r#"{ "server": {}, "mail": { "from": "noreply@example.com" } }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.get_extra("mail.from"),
            Some(&json!("noreply@example.com"))
        );
    }

    #[test]
    fn camel_case_request_keys() {
        let cfg = ServerConfig::from_json(
            r#"{ "server": { "request": { "timeout": 30, "bodySize": 1024 } } }"#,
        )
        .unwrap();
        assert_eq!(cfg.server.request.timeout, Some(30));
        assert_eq!(cfg.server.request.body_size, 1024);
    }
}
