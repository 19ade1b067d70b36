//! Portlens: company port and trade-lane analytics extracted from a live
//! browser session, normalized and cached.

pub mod cache;
pub mod capture;
pub mod config;
pub mod decode;
pub mod events;
pub mod normalize;
pub mod orchestrator;
pub mod service;
pub mod session;
pub mod types;

pub use cache::CacheStore;
pub use capture::{await_captures, CaptureOutcome, CapturePredicate, DocumentCoverage};
pub use config::{ConfigError, EndpointRule, EngineConfig};
pub use decode::{decode, decode_batch, StructuredValue, ValueOrigin};
pub use events::{EventBus, ExtractionEvent};
pub use normalize::{FieldAliases, Normalizer};
pub use orchestrator::{Analytics, LookupMode, Orchestrator};
pub use service::{Health, PortAnalytics};
pub use session::chromium::ChromiumSession;
pub use session::replay::{ReplayResponse, ReplaySession};
pub use session::{CaptureHandle, NetworkEvent, SessionClient};
pub use types::*;
