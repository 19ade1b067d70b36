//! Extraction event bus.
//!
//! A `tokio::sync::broadcast` channel carrying [`ExtractionEvent`] values.
//! The REST layer streams them as SSE; tests use them to observe stage
//! transitions. When nobody is subscribed, events are dropped.

use crate::types::{CompanyQuery, ErrorKind, ExtractionStage};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Everything the engine reports while serving lookups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExtractionEvent {
    /// A browser extraction cycle has started for a company.
    ExtractionStarted { company: String, url: String },
    /// The extraction moved to a new stage.
    StageChanged {
        company: String,
        stage: ExtractionStage,
        elapsed_ms: u64,
    },
    /// Captured data left some categories without records.
    CapturePartial {
        company: String,
        captured: usize,
        missing: Vec<String>,
    },
    /// The extraction succeeded and the result was cached.
    ExtractionComplete {
        company: String,
        export_ports: usize,
        import_ports: usize,
        trade_lanes: usize,
        partial: bool,
        total_ms: u64,
    },
    /// The extraction failed.
    ExtractionFailed {
        company: String,
        kind: ErrorKind,
        stage: ExtractionStage,
        error: String,
    },
    /// A lookup was served from cache.
    CacheHit { company: String },
    /// A caller attached to an extraction already in flight.
    JoinedInFlight { company: String },
    /// The cache was cleared by a maintenance call.
    CacheCleared { entries: usize },
}

impl ExtractionEvent {
    /// Company the event relates to; `None` for system events.
    pub fn company(&self) -> Option<&str> {
        match self {
            ExtractionEvent::ExtractionStarted { company, .. }
            | ExtractionEvent::StageChanged { company, .. }
            | ExtractionEvent::CapturePartial { company, .. }
            | ExtractionEvent::ExtractionComplete { company, .. }
            | ExtractionEvent::ExtractionFailed { company, .. }
            | ExtractionEvent::CacheHit { company }
            | ExtractionEvent::JoinedInFlight { company } => Some(company),
            ExtractionEvent::CacheCleared { .. } => None,
        }
    }

    /// Whether a subscriber filtering on `company` should see this event.
    ///
    /// Names are compared by lookup key, so case and runs of whitespace
    /// do not matter. System events always match.
    pub fn matches_company(&self, company: &str) -> bool {
        let Some(own) = self.company() else {
            return true;
        };
        match (CompanyQuery::parse(own), CompanyQuery::parse(company)) {
            (Ok(own), Ok(filter)) => own.key() == filter.key(),
            _ => false,
        }
    }
}

/// Broadcast hub for [`ExtractionEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExtractionEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: ExtractionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExtractionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
