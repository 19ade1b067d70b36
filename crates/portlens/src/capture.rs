//! Network capture: filter the navigation's traffic down to the company
//! data endpoints and collect their bodies within a bounded window.

use crate::config::{ConfigError, EndpointRule};
use crate::session::{CaptureHandle, NetworkEvent, ResponseMeta, SessionClient};
use crate::types::{CapturedResponse, Diagnostic, DiagnosticKind, EndpointCategory};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

struct CompiledRule {
    pattern: Regex,
    categories: Vec<EndpointCategory>,
    content_types: Vec<String>,
}

impl CompiledRule {
    fn accepts_mime(&self, mime: &str) -> bool {
        // Unknown MIME types are left to the decoder to sniff.
        mime.is_empty()
            || self.content_types.is_empty()
            || self
                .content_types
                .iter()
                .any(|prefix| mime.starts_with(prefix.as_str()))
    }
}

/// Decides which responses belong to the target data endpoints.
pub struct CapturePredicate {
    rules: Vec<CompiledRule>,
}

impl CapturePredicate {
    pub fn from_rules(rules: &[EndpointRule]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| ConfigError::Invalid {
                    field: "endpoint_rules",
                    reason: format!("{}: {e}", rule.pattern),
                })?;
                Ok(CompiledRule {
                    pattern,
                    categories: rule.categories.clone(),
                    content_types: rule
                        .content_types
                        .iter()
                        .map(|c| c.trim().to_ascii_lowercase())
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    /// Categories a response would satisfy, or `None` if no rule matches.
    ///
    /// When several categorised rules match, the narrowest ones win, so a
    /// dedicated `exit-ports` endpoint under a catch-all API prefix counts
    /// only as export ports. `Some(vec![])` means the response is captured
    /// as a page document (e.g. the company page itself).
    pub fn classify(&self, url: &str, mime_type: &str) -> Option<Vec<EndpointCategory>> {
        let mime = mime_type.trim().to_ascii_lowercase();
        let mut matched = false;
        let mut narrowest: Option<usize> = None;
        let mut categories = BTreeSet::new();
        for rule in &self.rules {
            if !rule.pattern.is_match(url) || !rule.accepts_mime(&mime) {
                continue;
            }
            matched = true;
            let width = rule.categories.len();
            if width == 0 {
                continue;
            }
            match narrowest {
                Some(current) if width > current => {}
                Some(current) if width == current => {
                    categories.extend(rule.categories.iter().copied());
                }
                _ => {
                    narrowest = Some(width);
                    categories = rule.categories.iter().copied().collect();
                }
            }
        }
        matched.then(|| categories.into_iter().collect())
    }

    /// Every category some rule can satisfy.
    pub fn expected_categories(&self) -> Vec<EndpointCategory> {
        self.rules
            .iter()
            .flat_map(|r| r.categories.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// What a capture window produced.
#[derive(Debug, Default)]
pub struct CaptureOutcome {
    /// Captured responses in order of arrival.
    pub responses: Vec<CapturedResponse>,
    /// The deadline passed before every expected category was seen.
    pub timed_out: bool,
    /// Expected categories with no capture.
    pub missing: Vec<EndpointCategory>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CaptureOutcome {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

struct Pending {
    seq: usize,
    meta: ResponseMeta,
    categories: Vec<EndpointCategory>,
    arrived_at: DateTime<Utc>,
}

enum Fetch {
    Captured,
    Skipped,
    DeadlinePassed,
}

/// Categories a captured page document fills on its own.
pub type DocumentCoverage<'a> = &'a (dyn Fn(&CapturedResponse) -> Vec<EndpointCategory> + Sync);

/// Accumulator for one capture window.
struct Window<'a> {
    session: &'a dyn SessionClient,
    predicate: &'a CapturePredicate,
    coverage: DocumentCoverage<'a>,
    deadline: Instant,
    next_seq: usize,
    pending: HashMap<String, Pending>,
    finished_early: HashSet<String>,
    done: HashSet<String>,
    captured: Vec<(usize, CapturedResponse)>,
    satisfied: BTreeSet<EndpointCategory>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Window<'a> {
    fn new(
        session: &'a dyn SessionClient,
        predicate: &'a CapturePredicate,
        coverage: DocumentCoverage<'a>,
        deadline: Instant,
    ) -> Self {
        Self {
            session,
            predicate,
            coverage,
            deadline,
            next_seq: 0,
            pending: HashMap::new(),
            finished_early: HashSet::new(),
            done: HashSet::new(),
            captured: Vec::new(),
            satisfied: BTreeSet::new(),
            diagnostics: Vec::new(),
        }
    }

    fn is_known(&self, request_id: &str) -> bool {
        self.done.contains(request_id) || self.pending.contains_key(request_id)
    }

    async fn on_event(&mut self, event: NetworkEvent) -> Fetch {
        match event {
            NetworkEvent::ResponseReceived(meta) => {
                if self.is_known(&meta.request_id) {
                    tracing::debug!("duplicate response {} for {}", meta.request_id, meta.url);
                    return Fetch::Skipped;
                }
                let Some(categories) = self.predicate.classify(&meta.url, &meta.mime_type) else {
                    return Fetch::Skipped;
                };
                if meta.status != 0 && !(200..300).contains(&meta.status) {
                    tracing::debug!("ignoring {} response from {}", meta.status, meta.url);
                    self.done.insert(meta.request_id);
                    return Fetch::Skipped;
                }
                tracing::debug!("candidate response {} ({})", meta.url, meta.mime_type);
                let pending = Pending {
                    seq: self.next_seq,
                    meta,
                    categories,
                    arrived_at: Utc::now(),
                };
                self.next_seq += 1;
                if self.finished_early.remove(&pending.meta.request_id) {
                    self.fetch(pending).await
                } else {
                    self.pending.insert(pending.meta.request_id.clone(), pending);
                    Fetch::Skipped
                }
            }
            NetworkEvent::LoadingFinished { request_id } => match self.pending.remove(&request_id) {
                Some(pending) => self.fetch(pending).await,
                None => {
                    if !self.done.contains(&request_id) {
                        self.finished_early.insert(request_id);
                    }
                    Fetch::Skipped
                }
            },
            NetworkEvent::LoadingFailed {
                request_id,
                error_text,
            } => {
                if let Some(pending) = self.pending.remove(&request_id) {
                    tracing::debug!("dropping failed load of {}: {error_text}", pending.meta.url);
                    self.done.insert(request_id);
                }
                Fetch::Skipped
            }
        }
    }

    async fn fetch(&mut self, pending: Pending) -> Fetch {
        let Pending {
            seq,
            meta,
            categories,
            arrived_at,
        } = pending;
        self.done.insert(meta.request_id.clone());

        let body = match tokio::time::timeout_at(
            self.deadline,
            self.session.response_body(&meta.request_id),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                tracing::warn!("body unavailable for {}: {e}", meta.url);
                self.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::BodyUnavailable,
                    url: Some(meta.url),
                    message: e.to_string(),
                });
                return Fetch::Skipped;
            }
            Err(_) => return Fetch::DeadlinePassed,
        };

        let response = CapturedResponse {
            request_id: meta.request_id,
            url: meta.url,
            mime_type: meta.mime_type,
            content_encoding: meta.content_encoding,
            status: meta.status,
            body,
            arrived_at,
            categories,
        };
        if response.categories.is_empty() {
            let covered = (self.coverage)(&response);
            tracing::debug!("document {} covers {covered:?}", response.url);
            self.satisfied.extend(covered);
        } else {
            self.satisfied.extend(response.categories.iter().copied());
        }
        self.captured.push((seq, response));
        Fetch::Captured
    }

    fn is_satisfied(&self, expected: &[EndpointCategory]) -> bool {
        !expected.is_empty() && expected.iter().all(|c| self.satisfied.contains(c))
    }

    fn finish(mut self, expected: &[EndpointCategory], timed_out: bool) -> CaptureOutcome {
        self.captured.sort_by_key(|(seq, _)| *seq);
        let missing: Vec<EndpointCategory> = expected
            .iter()
            .copied()
            .filter(|c| !self.satisfied.contains(c))
            .collect();
        CaptureOutcome {
            responses: self.captured.into_iter().map(|(_, r)| r).collect(),
            timed_out,
            missing,
            diagnostics: self.diagnostics,
        }
    }
}

/// Collect matching responses until every expected category has been
/// captured, the event source closes, or `timeout` elapses.
///
/// A page document counts toward completion for the categories `coverage`
/// reports for it. Never fails: on deadline the outcome carries whatever
/// was captured with `timed_out` set. Responses are deduplicated by
/// request id.
pub async fn await_captures(
    session: &dyn SessionClient,
    handle: &mut CaptureHandle,
    predicate: &CapturePredicate,
    coverage: DocumentCoverage<'_>,
    timeout: Duration,
) -> CaptureOutcome {
    let deadline = Instant::now() + timeout;
    let expected = predicate.expected_categories();
    let mut window = Window::new(session, predicate, coverage, deadline);
    let mut timed_out = false;

    while !window.is_satisfied(&expected) {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                break;
            }
        };
        let Some(event) = event else {
            tracing::debug!("capture source closed");
            break;
        };
        if let Fetch::DeadlinePassed = window.on_event(event).await {
            timed_out = true;
            break;
        }
    }

    let outcome = window.finish(&expected, timed_out);
    tracing::info!(
        "captured {} responses (timed_out={}, missing={:?})",
        outcome.responses.len(),
        outcome.timed_out,
        outcome.missing
    );
    outcome
}
