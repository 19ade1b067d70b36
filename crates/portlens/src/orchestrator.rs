//! Extraction orchestrator.
//!
//! Drives one company through
//! `Idle → Navigating → Capturing → Decoding → Normalizing → Cached | Failed`.
//!
//! Two guarantees are enforced here:
//! - at most one extraction per company key is in flight; later callers
//!   await the same shared result,
//! - at most one browser cycle runs at a time across all companies.
//!
//! Extractions run in spawned tasks, so a caller going away does not cancel
//! work other callers are waiting on.

use crate::cache::CacheStore;
use crate::capture::{await_captures, CapturePredicate};
use crate::config::EngineConfig;
use crate::decode::{decode, decode_batch};
use crate::events::{EventBus, ExtractionEvent};
use crate::normalize::Normalizer;
use crate::session::SessionClient;
use crate::types::{
    CapturedResponse, CompanyQuery, CompanyResult, Diagnostic, DiagnosticKind, ExtractError,
    ExtractResult, ExtractionStage, FailureReport,
};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

type Extraction = Shared<BoxFuture<'static, Result<Arc<CompanyResult>, FailureReport>>>;

/// How a lookup treats the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Serve a fresh cached result when there is one.
    CacheFirst,
    /// Always extract; the cached value survives a failed refresh.
    Refresh,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct Analytics {
    pub result: Arc<CompanyResult>,
    /// Served from cache without touching the browser.
    pub cached: bool,
}

/// Coordinates session, capture, decoding, normalization and cache.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<dyn SessionClient>,
    cache: Arc<CacheStore>,
    config: EngineConfig,
    predicate: CapturePredicate,
    normalizer: Normalizer,
    events: EventBus,
    /// Held for the whole navigate/capture cycle.
    browser: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashMap<String, Extraction>>,
}

impl Orchestrator {
    pub fn new(
        session: Arc<dyn SessionClient>,
        cache: Arc<CacheStore>,
        config: EngineConfig,
        events: EventBus,
    ) -> ExtractResult<Self> {
        config.validate()?;
        let predicate = CapturePredicate::from_rules(&config.endpoint_rules)?;
        let normalizer = Normalizer::new(config.max_records);
        Ok(Self {
            inner: Arc::new(Inner {
                session,
                cache,
                config,
                predicate,
                normalizer,
                events,
                browser: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    pub fn session(&self) -> &Arc<dyn SessionClient> {
        &self.inner.session
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of extractions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight_map().len()
    }

    /// Resolve analytics for `query`, extracting on a miss.
    pub async fn lookup(
        &self,
        query: &CompanyQuery,
        mode: LookupMode,
    ) -> Result<Analytics, FailureReport> {
        if mode == LookupMode::CacheFirst {
            if let Some(result) = self.cached(query) {
                return Ok(result);
            }
        }

        let extraction = {
            let mut in_flight = self.inner.in_flight_map();
            match in_flight.get(query.key()) {
                Some(existing) => {
                    tracing::debug!("joining in-flight extraction for {query}");
                    self.inner.events.emit(ExtractionEvent::JoinedInFlight {
                        company: query.name().to_string(),
                    });
                    existing.clone()
                }
                None => {
                    // An extraction may have completed between the first
                    // check and taking the lock.
                    if mode == LookupMode::CacheFirst {
                        if let Some(result) = self.cached(query) {
                            return Ok(result);
                        }
                    }
                    let extraction = self.spawn_extraction(query.clone());
                    in_flight.insert(query.key().to_string(), extraction.clone());
                    extraction
                }
            }
        };

        extraction.await.map(|result| Analytics {
            result,
            cached: false,
        })
    }

    fn cached(&self, query: &CompanyQuery) -> Option<Analytics> {
        let result = self.inner.cache.get(query)?;
        tracing::debug!("cache hit for {query}");
        self.inner.events.emit(ExtractionEvent::CacheHit {
            company: query.name().to_string(),
        });
        Some(Analytics {
            result,
            cached: true,
        })
    }

    fn spawn_extraction(&self, query: CompanyQuery) -> Extraction {
        let inner = Arc::clone(&self.inner);
        let key = query.key().to_string();
        let company = query.name().to_string();

        let task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let outcome = inner.run_extraction(&query).await;
                inner.in_flight_map().remove(query.key());
                outcome
            }
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    inner.in_flight_map().remove(&key);
                    let error = ExtractError::Internal(format!("extraction task failed: {e}"));
                    tracing::error!("extraction for {company} aborted: {e}");
                    Err(FailureReport::new(&company, ExtractionStage::Failed, &error))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn in_flight_map(&self) -> MutexGuard<'_, HashMap<String, Extraction>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_extraction(&self, query: &CompanyQuery) -> Result<Arc<CompanyResult>, FailureReport> {
        let _browser = self.browser.lock().await;
        let mut tracker = StageTracker::new(&self.events, query.name());
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        if query.slug().is_empty() {
            let error = ExtractError::InvalidQuery(format!(
                "\"{query}\" has no characters usable in a company URL"
            ));
            return Err(tracker.fail(error, diagnostics));
        }
        let url = match self.config.company_url(query) {
            Ok(url) => url,
            Err(e) => return Err(tracker.fail(e.into(), diagnostics)),
        };

        tracing::info!("extraction request: company={query}, url={url}");
        self.events.emit(ExtractionEvent::ExtractionStarted {
            company: query.name().to_string(),
            url: url.to_string(),
        });

        tracker.advance(ExtractionStage::Navigating);
        let mut handle = match self.session.begin_capture().await {
            Ok(handle) => handle,
            Err(e) => return Err(tracker.fail(e, diagnostics)),
        };
        if let Err(e) = self
            .session
            .navigate(url.as_str(), self.config.navigation_timeout())
            .await
        {
            return Err(tracker.fail(e, diagnostics));
        }

        tracker.advance(ExtractionStage::Capturing);
        let capture_timeout = self.config.capture_timeout();
        let page_sections = |response: &CapturedResponse| match decode(response) {
            Ok(values) => self.normalizer.covered_categories(&values),
            Err(_) => Vec::new(),
        };
        let outcome = await_captures(
            self.session.as_ref(),
            &mut handle,
            &self.predicate,
            &page_sections,
            capture_timeout,
        )
        .await;
        drop(handle);
        diagnostics.extend(outcome.diagnostics.iter().cloned());

        tracker.advance(ExtractionStage::Decoding);
        let batch = decode_batch(&outcome.responses);
        diagnostics.extend(batch.diagnostics);

        tracker.advance(ExtractionStage::Normalizing);
        let mut result = self
            .normalizer
            .normalize(query.name(), &batch.values, Utc::now());

        let missing: Vec<String> = result
            .missing_categories()
            .iter()
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            if outcome.timed_out {
                let message = format!(
                    "capture window of {}ms closed before {} were seen",
                    self.config.capture_timeout_ms,
                    missing.join(", ")
                );
                tracing::warn!("partial capture for {query}: {message}");
                diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::CaptureTimeout,
                    url: None,
                    message,
                });
            }
            self.events.emit(ExtractionEvent::CapturePartial {
                company: query.name().to_string(),
                captured: outcome.responses.len(),
                missing: missing.clone(),
            });
        }

        if result.is_empty() {
            let error = ExtractError::EmptyResult(query.name().to_string());
            return Err(tracker.fail(error, diagnostics));
        }
        result.partial = !missing.is_empty();
        result.diagnostics = diagnostics;

        let result = Arc::new(result);
        self.cache.put_default(query, Arc::clone(&result));
        tracker.advance(ExtractionStage::Cached);

        let total_ms = tracker.elapsed_ms();
        tracing::info!(
            "extraction complete: company={query}, export={}, import={}, lanes={}, partial={}, {total_ms}ms",
            result.export_ports.len(),
            result.import_ports.len(),
            result.trade_lanes.len(),
            result.partial
        );
        self.events.emit(ExtractionEvent::ExtractionComplete {
            company: query.name().to_string(),
            export_ports: result.export_ports.len(),
            import_ports: result.import_ports.len(),
            trade_lanes: result.trade_lanes.len(),
            partial: result.partial,
            total_ms,
        });
        Ok(result)
    }
}

/// Forward-only stage bookkeeping for one extraction.
struct StageTracker<'a> {
    events: &'a EventBus,
    company: &'a str,
    stage: ExtractionStage,
    started: Instant,
}

impl<'a> StageTracker<'a> {
    fn new(events: &'a EventBus, company: &'a str) -> Self {
        Self {
            events,
            company,
            stage: ExtractionStage::Idle,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn advance(&mut self, next: ExtractionStage) {
        debug_assert!(next > self.stage, "stage moved backwards: {} -> {next}", self.stage);
        self.stage = next;
        tracing::debug!("{}: {next}", self.company);
        self.events.emit(ExtractionEvent::StageChanged {
            company: self.company.to_string(),
            stage: next,
            elapsed_ms: self.elapsed_ms(),
        });
    }

    /// Record a failure in the current stage and move to `Failed`.
    fn fail(&mut self, error: ExtractError, diagnostics: Vec<Diagnostic>) -> FailureReport {
        let report = FailureReport::new(self.company, self.stage, &error).with_diagnostics(diagnostics);
        tracing::warn!("{report}");
        self.events.emit(ExtractionEvent::ExtractionFailed {
            company: self.company.to_string(),
            kind: report.kind,
            stage: self.stage,
            error: report.message.clone(),
        });
        self.advance(ExtractionStage::Failed);
        report
    }
}
