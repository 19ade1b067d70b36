//! Engine configuration: defaults, JSON file, environment overrides.

use crate::types::{CompanyQuery, EndpointCategory};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DEBUGGER_ENDPOINT: &str = "127.0.0.1:9222";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_NAVIGATION_TIMEOUT_MS: u64 = 45_000;
pub const DEFAULT_COMPANY_URL_TEMPLATE: &str = "https://www.importyeti.com/company/{slug}";

/// Environment variables read by [`EngineConfig::apply_env`].
pub const ENV_DEBUGGER: &str = "PORTLENS_DEBUGGER";
pub const ENV_CACHE_TTL_SECS: &str = "PORTLENS_CACHE_TTL_SECS";
pub const ENV_CAPTURE_TIMEOUT_MS: &str = "PORTLENS_CAPTURE_TIMEOUT_MS";
pub const ENV_NAVIGATION_TIMEOUT_MS: &str = "PORTLENS_NAVIGATION_TIMEOUT_MS";
pub const ENV_COMPANY_URL_TEMPLATE: &str = "PORTLENS_COMPANY_URL";

/// Errors raised while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Identifies responses that carry company data.
///
/// A rule with no categories still captures matching responses (e.g. the
/// company HTML document) but does not count toward capture completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Regular expression matched against the response URL.
    pub pattern: String,
    #[serde(default)]
    pub categories: Vec<EndpointCategory>,
    /// Accepted MIME type prefixes. Empty accepts any.
    #[serde(default)]
    pub content_types: Vec<String>,
}

impl EndpointRule {
    pub fn new(pattern: &str, categories: &[EndpointCategory], content_types: &[&str]) -> Self {
        Self {
            pattern: pattern.to_string(),
            categories: categories.to_vec(),
            content_types: content_types.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Default endpoint rules for the company data API and page.
pub fn default_endpoint_rules() -> Vec<EndpointRule> {
    use EndpointCategory::*;
    vec![
        EndpointRule::new(r"/api/company/", &EndpointCategory::ALL, &["application/json"]),
        EndpointRule::new(
            r"/data/v\d+(\.\d+)?/company/",
            &EndpointCategory::ALL,
            &["application/json"],
        ),
        EndpointRule::new(
            r"(?i)(exit|origin|from)[_-]?ports",
            &[ExportPorts],
            &["application/json"],
        ),
        EndpointRule::new(
            r"(?i)(entry|destination|to)[_-]?ports",
            &[ImportPorts],
            &["application/json"],
        ),
        EndpointRule::new(
            r"(?i)(lane|route)s?([/?_-]|$)",
            &[TradeLanes],
            &["application/json"],
        ),
        EndpointRule::new(r"/company/[^/?#]+/?(\?.*)?$", &[], &["text/html"]),
    ]
}

/// Runtime configuration for the extraction engine. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Browser remote-debugging endpoint (`host:port`, `http://…` or `ws://…`).
    pub debugger_endpoint: String,
    pub cache_ttl_secs: u64,
    pub capture_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    /// Company page URL with a `{slug}` placeholder.
    pub company_url_template: String,
    pub endpoint_rules: Vec<EndpointRule>,
    /// Keep only the top N records per category.
    pub max_records: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debugger_endpoint: DEFAULT_DEBUGGER_ENDPOINT.to_string(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            capture_timeout_ms: DEFAULT_CAPTURE_TIMEOUT_MS,
            navigation_timeout_ms: DEFAULT_NAVIGATION_TIMEOUT_MS,
            company_url_template: DEFAULT_COMPANY_URL_TEMPLATE.to_string(),
            endpoint_rules: default_endpoint_rules(),
            max_records: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `PORTLENS_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let read_u64 = |name: &str| {
            read(name).and_then(|v| match v.parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!("ignoring {name}={v}: not an unsigned integer");
                    None
                }
            })
        };

        if let Some(v) = read(ENV_DEBUGGER) {
            self.debugger_endpoint = v;
        }
        if let Some(v) = read_u64(ENV_CACHE_TTL_SECS) {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = read_u64(ENV_CAPTURE_TIMEOUT_MS) {
            self.capture_timeout_ms = v;
        }
        if let Some(v) = read_u64(ENV_NAVIGATION_TIMEOUT_MS) {
            self.navigation_timeout_ms = v;
        }
        if let Some(v) = read(ENV_COMPANY_URL_TEMPLATE) {
            self.company_url_template = v;
        }
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debugger_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "debugger_endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        for (field, value) in [
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("capture_timeout_ms", self.capture_timeout_ms),
            ("navigation_timeout_ms", self.navigation_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !self.company_url_template.contains("{slug}") {
            return Err(ConfigError::Invalid {
                field: "company_url_template",
                reason: "must contain a {slug} placeholder".to_string(),
            });
        }
        url::Url::parse(&self.company_url_template.replace("{slug}", "acme")).map_err(|e| {
            ConfigError::Invalid {
                field: "company_url_template",
                reason: e.to_string(),
            }
        })?;
        for rule in &self.endpoint_rules {
            regex::Regex::new(&rule.pattern).map_err(|e| ConfigError::Invalid {
                field: "endpoint_rules",
                reason: format!("{}: {e}", rule.pattern),
            })?;
        }
        if self.max_records == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_records",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    /// Build the company page URL for a query.
    pub fn company_url(&self, query: &CompanyQuery) -> Result<url::Url, ConfigError> {
        let raw = self.company_url_template.replace("{slug}", &query.slug());
        url::Url::parse(&raw).map_err(|e| ConfigError::Invalid {
            field: "company_url_template",
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.debugger_endpoint, "127.0.0.1:9222");
    }

    #[test]
    fn test_company_url() {
        let config = EngineConfig::default();
        let q = CompanyQuery::parse("Kimberly-Clark").unwrap();
        assert_eq!(
            config.company_url(&q).unwrap().as_str(),
            "https://www.importyeti.com/company/kimberly-clark"
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_DEBUGGER, " 10.0.0.5:9333 "),
            (ENV_CACHE_TTL_SECS, "120"),
            (ENV_CAPTURE_TIMEOUT_MS, "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_env_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.debugger_endpoint, "10.0.0.5:9333");
        assert_eq!(config.cache_ttl_secs, 120);
        assert_eq!(config.capture_timeout_ms, DEFAULT_CAPTURE_TIMEOUT_MS);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cache_ttl_secs": 60, "max_records": 5}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.max_records, Some(5));
        assert_eq!(config.endpoint_rules, default_endpoint_rules());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig {
            capture_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "capture_timeout_ms", .. })
        ));

        config.capture_timeout_ms = 1000;
        config.company_url_template = "https://example.com/company".to_string();
        assert!(config.validate().is_err());

        config.company_url_template = DEFAULT_COMPANY_URL_TEMPLATE.to_string();
        config.endpoint_rules.push(EndpointRule::new("([", &[], &[]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "endpoint_rules", .. })
        ));
    }
}
