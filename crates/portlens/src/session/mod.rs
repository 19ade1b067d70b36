//! Browser session abstraction.
//!
//! Defines the [`SessionClient`] trait the orchestrator drives. The client
//! is a control channel (navigate, fetch bodies) plus a source of raw
//! network events; it never interprets page content. Implementations:
//! [`chromium::ChromiumSession`] over the DevTools protocol and
//! [`replay::ReplaySession`], which replays canned traffic.

pub mod chromium;
pub mod replay;

use crate::types::ExtractResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Response metadata reported when headers arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub request_id: String,
    pub url: String,
    /// Content type, including parameters such as `charset` when known.
    pub mime_type: String,
    pub status: u16,
    pub content_encoding: Option<String>,
}

/// Raw network events observed during a navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Response headers arrived.
    ResponseReceived(ResponseMeta),
    /// The body is complete and can be fetched.
    LoadingFinished { request_id: String },
    /// The request failed; no body will follow.
    LoadingFailed {
        request_id: String,
        error_text: String,
    },
}

impl NetworkEvent {
    pub fn request_id(&self) -> &str {
        match self {
            NetworkEvent::ResponseReceived(meta) => &meta.request_id,
            NetworkEvent::LoadingFinished { request_id }
            | NetworkEvent::LoadingFailed { request_id, .. } => request_id,
        }
    }
}

/// Receiving end of a capture subscription.
///
/// Dropping the handle stops the forwarding tasks feeding it.
pub struct CaptureHandle {
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    forwarders: Vec<AbortHandle>,
}

impl CaptureHandle {
    pub fn new(events: mpsc::UnboundedReceiver<NetworkEvent>) -> Self {
        Self {
            events,
            forwarders: Vec::new(),
        }
    }

    /// Attach a task whose lifetime is bound to this handle.
    pub fn with_forwarder(mut self, handle: AbortHandle) -> Self {
        self.forwarders.push(handle);
        self
    }

    /// Next event, or `None` once the source has closed.
    pub async fn next_event(&mut self) -> Option<NetworkEvent> {
        self.events.recv().await
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

/// A controllable browser session.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Start receiving network events. Only events produced after this
    /// call are delivered.
    async fn begin_capture(&self) -> ExtractResult<CaptureHandle>;

    /// Point the tab at `url`. Re-navigating re-triggers every request.
    async fn navigate(&self, url: &str, timeout: Duration) -> ExtractResult<()>;

    /// Fetch the body of a finished response.
    async fn response_body(&self, request_id: &str) -> ExtractResult<Vec<u8>>;

    /// Whether the browser endpoint currently answers.
    async fn ping(&self) -> bool;
}
