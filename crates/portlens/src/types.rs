//! Core data types for company port analytics and extraction failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated company lookup.
///
/// The display name is trimmed; the key is lower-cased with inner
/// whitespace collapsed so `"  Acme   Corp "` and `"acme corp"` share a
/// cache slot and an in-flight extraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompanyQuery {
    name: String,
    key: String,
}

impl CompanyQuery {
    /// Validate and normalize a raw company name.
    pub fn parse(raw: &str) -> ExtractResult<Self> {
        let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(ExtractError::InvalidQuery(
                "company name must not be empty".to_string(),
            ));
        }
        let key = name.to_lowercase();
        Ok(Self { name, key })
    }

    /// Trimmed display name, as supplied by the caller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Case-normalized lookup key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// URL slug: ASCII alphanumerics joined by single hyphens, `&` spelled out.
    pub fn slug(&self) -> String {
        let expanded = self.key.replace('&', " and ");
        let mut slug = String::with_capacity(expanded.len());
        let mut pending_hyphen = false;
        for ch in expanded.chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_hyphen && !slug.is_empty() {
                    slug.push('-');
                }
                pending_hyphen = false;
                slug.push(ch);
            } else {
                pending_hyphen = true;
            }
        }
        slug
    }
}

impl fmt::Display for CompanyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The three data categories a company page exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    ExportPorts,
    ImportPorts,
    TradeLanes,
}

impl EndpointCategory {
    pub const ALL: [EndpointCategory; 3] = [
        EndpointCategory::ExportPorts,
        EndpointCategory::ImportPorts,
        EndpointCategory::TradeLanes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointCategory::ExportPorts => "export_ports",
            EndpointCategory::ImportPorts => "import_ports",
            EndpointCategory::TradeLanes => "trade_lanes",
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network response recorded during a navigation.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    /// DevTools request identifier (dedup key).
    pub request_id: String,
    pub url: String,
    pub mime_type: String,
    /// Value of the `Content-Encoding` header, if any.
    pub content_encoding: Option<String>,
    pub status: u16,
    /// Raw body bytes as delivered by the browser.
    pub body: Vec<u8>,
    pub arrived_at: DateTime<Utc>,
    /// Endpoint categories this response was matched against.
    pub categories: Vec<EndpointCategory>,
}

/// Shipments through a single port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: String,
    pub shipments: u64,
}

/// Shipments along an exit → entry port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneRecord {
    pub exit_port: String,
    pub entry_port: String,
    pub shipments: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    CaptureTimeout,
    DecodeError,
    /// A matching response finished but its body could not be fetched.
    BodyUnavailable,
}

/// A non-fatal problem observed while extracting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub message: String,
}

/// Normalized analytics for one company. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyResult {
    pub company: String,
    pub export_ports: Vec<PortRecord>,
    pub import_ports: Vec<PortRecord>,
    pub trade_lanes: Vec<LaneRecord>,
    pub extracted_at: DateTime<Utc>,
    /// Set when at least one category came back empty.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl CompanyResult {
    /// Total records across all three categories.
    pub fn record_count(&self) -> usize {
        self.export_ports.len() + self.import_ports.len() + self.trade_lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Categories with no records, in canonical order.
    pub fn missing_categories(&self) -> Vec<EndpointCategory> {
        EndpointCategory::ALL
            .into_iter()
            .filter(|category| match category {
                EndpointCategory::ExportPorts => self.export_ports.is_empty(),
                EndpointCategory::ImportPorts => self.import_ports.is_empty(),
                EndpointCategory::TradeLanes => self.trade_lanes.is_empty(),
            })
            .collect()
    }
}

/// Stages of a single extraction. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStage {
    Idle,
    Navigating,
    Capturing,
    Decoding,
    Normalizing,
    Cached,
    Failed,
}

impl ExtractionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionStage::Idle => "idle",
            ExtractionStage::Navigating => "navigating",
            ExtractionStage::Capturing => "capturing",
            ExtractionStage::Decoding => "decoding",
            ExtractionStage::Normalizing => "normalizing",
            ExtractionStage::Cached => "cached",
            ExtractionStage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExtractionStage::Cached | ExtractionStage::Failed)
    }
}

impl fmt::Display for ExtractionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Navigation,
    CaptureTimeout,
    Decode,
    EmptyResult,
    InvalidQuery,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Navigation => "navigation",
            ErrorKind::CaptureTimeout => "capture_timeout",
            ErrorKind::Decode => "decode",
            ErrorKind::EmptyResult => "empty_result",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors raised while decoding a single captured payload.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Failed to decompress {encoding} body: {source}")]
    Decompress {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("No structured data found in {0} body")]
    NoStructuredData(String),
}

/// Errors that can occur while extracting company analytics.
#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Cannot reach browser debugging endpoint: {0}")]
    Connection(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("No matching responses captured within {waited_ms}ms")]
    CaptureTimeout { waited_ms: u64 },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("No data available for {0}")]
    EmptyResult(String),

    #[error("Invalid company query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Connection(_) => ErrorKind::Connection,
            ExtractError::Navigation(_) => ErrorKind::Navigation,
            ExtractError::CaptureTimeout { .. } => ErrorKind::CaptureTimeout,
            ExtractError::Decode(_) => ErrorKind::Decode,
            ExtractError::EmptyResult(_) => ErrorKind::EmptyResult,
            ExtractError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            ExtractError::Config(_) | ExtractError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience result type.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// A failed lookup as reported to the serving layer.
///
/// Cloneable so every caller waiting on the same in-flight extraction
/// receives an identical report.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} failure for {company} while {stage}: {message}")]
pub struct FailureReport {
    pub company: String,
    pub kind: ErrorKind,
    /// Stage the extraction was in when the error occurred.
    pub stage: ExtractionStage,
    pub message: String,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl FailureReport {
    pub fn new(company: &str, stage: ExtractionStage, error: &ExtractError) -> Self {
        Self {
            company: company.to_string(),
            kind: error.kind(),
            stage,
            message: error.to_string(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_normalization() {
        let q = CompanyQuery::parse("  Kimberly-Clark   Corp ").unwrap();
        assert_eq!(q.name(), "Kimberly-Clark Corp");
        assert_eq!(q.key(), "kimberly-clark corp");
        assert_eq!(q, CompanyQuery::parse("kimberly-clark corp").unwrap());
    }

    #[test]
    fn test_query_rejects_blank() {
        let err = CompanyQuery::parse(" \t ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
    }

    #[test]
    fn test_slug() {
        let q = CompanyQuery::parse("Procter & Gamble Co.").unwrap();
        assert_eq!(q.slug(), "procter-and-gamble-co");
        let q = CompanyQuery::parse("  --Acme!! ").unwrap();
        assert_eq!(q.slug(), "acme");
    }

    #[test]
    fn test_failure_report_display() {
        let err = ExtractError::EmptyResult("Acme".to_string());
        let report = FailureReport::new("Acme", ExtractionStage::Normalizing, &err);
        assert_eq!(report.kind, ErrorKind::EmptyResult);
        assert_eq!(
            report.to_string(),
            "empty_result failure for Acme while normalizing: No data available for Acme"
        );
    }

    #[test]
    fn test_stage_ordering() {
        assert!(ExtractionStage::Idle < ExtractionStage::Navigating);
        assert!(ExtractionStage::Normalizing < ExtractionStage::Cached);
        assert!(ExtractionStage::Failed.is_terminal());
        assert!(!ExtractionStage::Decoding.is_terminal());
    }
}
