//! DevTools session attached to an already-running Chromium via chromiumoxide.
//!
//! The browser is expected to be started by the operator with
//! `--remote-debugging-port` and an authenticated profile. The session
//! connects lazily, opens one dedicated tab and reuses it for every
//! extraction. A dropped connection is re-established on the next call.

use super::{CaptureHandle, NetworkEvent, ResponseMeta, SessionClient};
use crate::types::{DecodeError, ExtractError, ExtractResult};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams, RequestId,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Turn a configured endpoint into something `Browser::connect` accepts.
///
/// Bare `host:port` becomes `http://host:port`; chromiumoxide resolves the
/// WebSocket debugger URL from `/json/version` for HTTP endpoints.
pub fn debugger_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let has_scheme = ["ws://", "wss://", "http://", "https://"]
        .iter()
        .any(|scheme| endpoint.starts_with(scheme));
    if has_scheme {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// Case-insensitive header lookup on a DevTools header object.
fn header_value(headers: &serde_json::Value, name: &str) -> Option<String> {
    headers
        .as_object()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_meta(event: &EventResponseReceived) -> ResponseMeta {
    let headers = event.response.headers.inner();
    let mime_type =
        header_value(headers, "content-type").unwrap_or_else(|| event.response.mime_type.clone());
    ResponseMeta {
        request_id: event.request_id.inner().clone(),
        url: event.response.url.clone(),
        mime_type,
        status: u16::try_from(event.response.status).unwrap_or(0),
        content_encoding: header_value(headers, "content-encoding"),
    }
}

/// A live DevTools connection plus the tab we drive.
struct Attached {
    browser: Browser,
    page: Page,
    alive: Arc<AtomicBool>,
    handler: JoinHandle<()>,
}

impl Attached {
    async fn open(endpoint: &str) -> ExtractResult<Self> {
        let url = debugger_url(endpoint);
        let (browser, mut handler) = Browser::connect(url.clone())
            .await
            .map_err(|e| ExtractError::Connection(format!("{url}: {e}")))?;

        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("devtools handler error: {e}");
                }
            }
            flag.store(false, Ordering::Relaxed);
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ExtractError::Connection(format!("failed to open tab: {e}")))?;
        page.execute(EnableParams::default())
            .await
            .map_err(|e| ExtractError::Connection(format!("failed to enable network domain: {e}")))?;

        tracing::info!("attached to browser at {url}");
        Ok(Self {
            browser,
            page,
            alive,
            handler,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// [`SessionClient`] backed by a remote Chromium tab.
pub struct ChromiumSession {
    endpoint: String,
    attached: Mutex<Option<Arc<Attached>>>,
}

impl ChromiumSession {
    /// Create a session that connects on first use.
    pub fn lazy(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            attached: Mutex::new(None),
        }
    }

    /// Connect immediately, failing with [`ExtractError::Connection`] if the
    /// debugging endpoint cannot be reached.
    pub async fn connect(endpoint: &str) -> ExtractResult<Self> {
        let session = Self::lazy(endpoint);
        session.attached().await?;
        Ok(session)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn attached(&self) -> ExtractResult<Arc<Attached>> {
        let mut slot = self.attached.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            tracing::warn!("browser connection lost, reconnecting to {}", self.endpoint);
        }
        let fresh = Arc::new(Attached::open(&self.endpoint).await?);
        *slot = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Current connection without connecting.
    async fn current(&self) -> ExtractResult<Arc<Attached>> {
        self.attached
            .lock()
            .await
            .as_ref()
            .filter(|a| a.is_alive())
            .cloned()
            .ok_or_else(|| ExtractError::Connection("browser session is not attached".to_string()))
    }
}

#[async_trait]
impl SessionClient for ChromiumSession {
    async fn begin_capture(&self) -> ExtractResult<CaptureHandle> {
        let attached = self.attached().await?;
        let page = &attached.page;
        let listen_err = |e| ExtractError::Connection(format!("failed to subscribe to network events: {e}"));

        let mut responses = Box::pin(
            page.event_listener::<EventResponseReceived>()
                .await
                .map_err(listen_err)?,
        );
        let mut finished = Box::pin(
            page.event_listener::<EventLoadingFinished>()
                .await
                .map_err(listen_err)?,
        );
        let mut failed = Box::pin(
            page.event_listener::<EventLoadingFailed>()
                .await
                .map_err(listen_err)?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(ev) = responses.next() => NetworkEvent::ResponseReceived(response_meta(&ev)),
                    Some(ev) = finished.next() => NetworkEvent::LoadingFinished {
                        request_id: ev.request_id.inner().clone(),
                    },
                    Some(ev) = failed.next() => NetworkEvent::LoadingFailed {
                        request_id: ev.request_id.inner().clone(),
                        error_text: ev.error_text.clone(),
                    },
                    else => break,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(CaptureHandle::new(rx).with_forwarder(forwarder.abort_handle()))
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> ExtractResult<()> {
        let attached = self.attached().await?;
        match tokio::time::timeout(timeout, attached.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if !attached.is_alive() => {
                Err(ExtractError::Connection(format!("browser went away: {e}")))
            }
            Ok(Err(e)) => Err(ExtractError::Navigation(format!("{url}: {e}"))),
            Err(_) => Err(ExtractError::Navigation(format!(
                "{url}: timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn response_body(&self, request_id: &str) -> ExtractResult<Vec<u8>> {
        let attached = self.current().await?;
        let response = attached
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await
            .map_err(|e| ExtractError::Connection(format!("failed to fetch body {request_id}: {e}")))?;

        if response.result.base64_encoded {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(response.result.body.as_bytes())
                .map_err(DecodeError::from)?;
            Ok(bytes)
        } else {
            Ok(response.result.body.clone().into_bytes())
        }
    }

    async fn ping(&self) -> bool {
        let version = async {
            let attached = self.attached().await?;
            attached
                .browser
                .version()
                .await
                .map_err(|e| ExtractError::Connection(e.to_string()))
        };
        matches!(tokio::time::timeout(PING_TIMEOUT, version).await, Ok(Ok(_)))
    }
}
