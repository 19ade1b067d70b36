//! A [`SessionClient`] that replays canned network traffic.
//!
//! Each navigation emits the configured responses after their delays,
//! measured from the start of the navigation. Used by the test suites and
//! by the server's `--replay` mode to serve fixture data without a browser.

use super::{CaptureHandle, NetworkEvent, ResponseMeta, SessionClient};
use crate::types::{ExtractError, ExtractResult};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// One response the replay emits on every navigation.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub url: String,
    pub mime_type: String,
    pub status: u16,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
    /// Offset from the start of the navigation.
    pub delay: Duration,
    /// Emit the response twice under the same request id.
    pub duplicate: bool,
    /// Report a failed load instead of finishing.
    pub failure: Option<String>,
    /// Finish the load but make the body unavailable.
    pub body_missing: bool,
}

impl ReplayResponse {
    pub fn raw(url: &str, mime_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.to_string(),
            mime_type: mime_type.to_string(),
            status: 200,
            content_encoding: None,
            body: body.into(),
            delay: Duration::ZERO,
            duplicate: false,
            failure: None,
            body_missing: false,
        }
    }

    pub fn json(url: &str, value: serde_json::Value) -> Self {
        Self::raw(url, "application/json", value.to_string())
    }

    pub fn html(url: &str, html: &str) -> Self {
        Self::raw(url, "text/html; charset=utf-8", html)
    }

    /// JSON body compressed with gzip and labelled `Content-Encoding: gzip`.
    pub fn gzip_json(url: &str, value: serde_json::Value) -> Self {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let body = encoder
            .write_all(value.to_string().as_bytes())
            .and_then(|()| encoder.finish())
            .unwrap_or_default();
        Self::raw(url, "application/json", body).with_encoding("gzip")
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_string());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn duplicated(mut self) -> Self {
        self.duplicate = true;
        self
    }

    pub fn failed(mut self, error_text: &str) -> Self {
        self.failure = Some(error_text.to_string());
        self
    }

    pub fn without_body(mut self) -> Self {
        self.body_missing = true;
        self
    }
}

/// On-disk replay fixture.
#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    navigation_delay_ms: u64,
    responses: Vec<FixtureResponse>,
}

#[derive(Debug, Deserialize)]
struct FixtureResponse {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    gzip: bool,
    /// JSON value, or a string used verbatim (e.g. HTML).
    body: serde_json::Value,
}

impl FixtureResponse {
    fn into_response(self) -> ReplayResponse {
        let response = match (self.body, self.gzip) {
            (serde_json::Value::String(text), _) => ReplayResponse::raw(
                &self.url,
                self.mime_type.as_deref().unwrap_or("text/html; charset=utf-8"),
                text,
            ),
            (value, true) => ReplayResponse::gzip_json(&self.url, value),
            (value, false) => ReplayResponse::json(&self.url, value),
        };
        let response = match self.mime_type {
            Some(mime) => ReplayResponse { mime_type: mime, ..response },
            None => response,
        };
        response.with_delay(Duration::from_millis(self.delay_ms))
    }
}

/// Replaying fake browser.
pub struct ReplaySession {
    responses: Mutex<Vec<ReplayResponse>>,
    navigation_delay: Mutex<Duration>,
    navigation_error: Mutex<Option<String>>,
    reachable: AtomicBool,
    navigations: AtomicUsize,
    listener: Mutex<Option<mpsc::UnboundedSender<NetworkEvent>>>,
    /// Bodies of the current navigation's responses.
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    emitter: Mutex<Option<AbortHandle>>,
    visited: Mutex<Vec<String>>,
}

impl Default for ReplaySession {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ReplaySession {
    pub fn new(responses: Vec<ReplayResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            navigation_delay: Mutex::new(Duration::ZERO),
            navigation_error: Mutex::new(None),
            reachable: AtomicBool::new(true),
            navigations: AtomicUsize::new(0),
            listener: Mutex::new(None),
            bodies: Arc::new(Mutex::new(HashMap::new())),
            emitter: Mutex::new(None),
            visited: Mutex::new(Vec::new()),
        }
    }

    /// Load a JSON fixture (`{"responses": [{"url", "body", ...}]}`).
    pub fn from_fixture<P: AsRef<Path>>(path: P) -> ExtractResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::Internal(format!("failed to read replay fixture {}: {e}", path.display()))
        })?;
        let fixture: Fixture = serde_json::from_str(&content).map_err(|e| {
            ExtractError::Internal(format!("invalid replay fixture {}: {e}", path.display()))
        })?;
        let session = Self::new(
            fixture
                .responses
                .into_iter()
                .map(FixtureResponse::into_response)
                .collect(),
        );
        session.set_navigation_delay(Duration::from_millis(fixture.navigation_delay_ms));
        Ok(session)
    }

    pub fn with_navigation_delay(self, delay: Duration) -> Self {
        self.set_navigation_delay(delay);
        self
    }

    pub fn set_navigation_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.navigation_delay.lock() {
            *slot = delay;
        }
    }

    /// Make subsequent navigations fail with `error`, or succeed again with `None`.
    pub fn set_navigation_error(&self, error: Option<&str>) {
        if let Ok(mut slot) = self.navigation_error.lock() {
            *slot = error.map(str::to_string);
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_responses(&self, responses: Vec<ReplayResponse>) {
        if let Ok(mut slot) = self.responses.lock() {
            *slot = responses;
        }
    }

    /// Number of navigations performed so far.
    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    /// URLs navigated to, in order.
    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Stop the previous navigation's traffic and forget its bodies.
    fn reset_traffic(&self) {
        if let Some(emitter) = self.emitter.lock().ok().and_then(|mut slot| slot.take()) {
            emitter.abort();
        }
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.clear();
        }
    }

    fn ensure_reachable(&self) -> ExtractResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExtractError::Connection("replay browser is offline".to_string()))
        }
    }
}

#[async_trait]
impl SessionClient for ReplaySession {
    async fn begin_capture(&self) -> ExtractResult<CaptureHandle> {
        self.ensure_reachable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(tx);
        }
        Ok(CaptureHandle::new(rx))
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> ExtractResult<()> {
        self.ensure_reachable()?;
        self.reset_traffic();
        let nav = self.navigations.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut visited) = self.visited.lock() {
            visited.push(url.to_string());
        }

        let delay = self.navigation_delay.lock().map(|d| *d).unwrap_or_default();
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ExtractError::Navigation(format!(
                "{url}: timed out after {}ms",
                timeout.as_millis()
            )));
        }
        let failure = self.navigation_error.lock().ok().and_then(|e| e.clone());
        if let Some(error) = failure {
            tokio::time::sleep(delay).await;
            return Err(ExtractError::Navigation(format!("{url}: {error}")));
        }

        let responses = self.responses.lock().map(|r| r.clone()).unwrap_or_default();
        let listener = self.listener.lock().ok().and_then(|l| l.clone());
        if let Some(tx) = listener {
            let bodies = Arc::clone(&self.bodies);
            let started = Instant::now();
            let mut scheduled: Vec<(usize, ReplayResponse)> =
                responses.into_iter().enumerate().collect();
            scheduled.sort_by_key(|(i, r)| (r.delay, *i));
            let emitter = tokio::spawn(async move {
                for (i, response) in scheduled {
                    tokio::time::sleep_until(started + response.delay).await;
                    let request_id = format!("replay-{nav}.{i}");
                    if !response.body_missing {
                        if let Ok(mut map) = bodies.lock() {
                            map.insert(request_id.clone(), response.body.clone());
                        }
                    }
                    let meta = ResponseMeta {
                        request_id: request_id.clone(),
                        url: response.url.clone(),
                        mime_type: response.mime_type.clone(),
                        status: response.status,
                        content_encoding: response.content_encoding.clone(),
                    };
                    let mut events = vec![NetworkEvent::ResponseReceived(meta)];
                    events.push(match &response.failure {
                        Some(error_text) => NetworkEvent::LoadingFailed {
                            request_id: request_id.clone(),
                            error_text: error_text.clone(),
                        },
                        None => NetworkEvent::LoadingFinished {
                            request_id: request_id.clone(),
                        },
                    });
                    if response.duplicate {
                        events.extend(events.clone());
                    }
                    for event in events {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            });
            if let Ok(mut slot) = self.emitter.lock() {
                *slot = Some(emitter.abort_handle());
            }
        }

        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn response_body(&self, request_id: &str) -> ExtractResult<Vec<u8>> {
        self.ensure_reachable()?;
        self.bodies
            .lock()
            .ok()
            .and_then(|map| map.get(request_id).cloned())
            .ok_or_else(|| {
                ExtractError::Connection(format!("No resource with given identifier: {request_id}"))
            })
    }

    async fn ping(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;

    #[tokio::test(start_paused = true)]
    async fn test_replay_emits_in_delay_order() {
        let session = ReplaySession::new(vec![
            ReplayResponse::json("https://x.test/late", json!({"a": 1}))
                .with_delay(Duration::from_millis(500)),
            ReplayResponse::json("https://x.test/early", json!({"b": 2}))
                .with_delay(Duration::from_millis(10)),
        ]);
        let mut handle = session.begin_capture().await.unwrap();
        session
            .navigate("https://x.test/company/acme", Duration::from_secs(5))
            .await
            .unwrap();

        let first = handle.next_event().await.unwrap();
        match first {
            NetworkEvent::ResponseReceived(meta) => assert_eq!(meta.url, "https://x.test/early"),
            other => panic!("unexpected event: {other:?}"),
        }
        let finished = handle.next_event().await.unwrap();
        let body = session.response_body(finished.request_id()).await.unwrap();
        assert_eq!(body, br#"{"b":2}"#.to_vec());
        assert_eq!(session.navigations(), 1);
        assert_eq!(session.visited(), vec!["https://x.test/company/acme".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_navigation_forgets_previous_bodies() {
        let session = ReplaySession::new(vec![ReplayResponse::json(
            "https://x.test/api/company/acme",
            json!({"exit_ports": []}),
        )]);
        let mut handle = session.begin_capture().await.unwrap();

        session
            .navigate("https://x.test/company/acme", Duration::from_secs(5))
            .await
            .unwrap();
        let first = handle.next_event().await.unwrap().request_id().to_string();
        assert!(session.response_body(&first).await.is_ok());

        session
            .navigate("https://x.test/company/globex", Duration::from_secs(5))
            .await
            .unwrap();
        let second = loop {
            let event = handle.next_event().await.unwrap();
            if event.request_id() != first {
                break event.request_id().to_string();
            }
        };
        assert_ne!(first, second);
        assert!(matches!(
            session.response_body(&first).await,
            Err(ExtractError::Connection(_))
        ));
        assert!(session.response_body(&second).await.is_ok());
        assert_eq!(session.bodies.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gzip_json_body() {
        let response = ReplayResponse::gzip_json("https://x.test/a", json!({"lanes": []}));
        assert_eq!(response.content_encoding.as_deref(), Some("gzip"));
        let mut text = String::new();
        flate2::read::GzDecoder::new(response.body.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, r#"{"lanes":[]}"#);
    }

    #[tokio::test]
    async fn test_navigation_error_and_offline() {
        let session = ReplaySession::default();
        session.set_navigation_error(Some("net::ERR_NAME_NOT_RESOLVED"));
        let err = session
            .navigate("https://x.test/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Navigation(_)));

        session.set_reachable(false);
        assert!(!session.ping().await);
        assert!(matches!(
            session.begin_capture().await,
            Err(ExtractError::Connection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_timeout() {
        let session = ReplaySession::default().with_navigation_delay(Duration::from_secs(60));
        let err = session
            .navigate("https://x.test/", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 2000ms"));
    }

    #[test]
    fn test_fixture_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.json");
        std::fs::write(
            &path,
            r#"{
                "navigation_delay_ms": 5,
                "responses": [
                    {"url": "https://x.test/api/company/acme", "body": {"exit_ports": []}, "gzip": true},
                    {"url": "https://x.test/company/acme", "body": "<html></html>", "delay_ms": 20}
                ]
            }"#,
        )
        .unwrap();

        let session = ReplaySession::from_fixture(&path).unwrap();
        let responses = session.responses.lock().unwrap().clone();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].content_encoding.as_deref(), Some("gzip"));
        assert_eq!(&responses[0].body[..2], &[0x1f, 0x8b]);
        assert!(responses[1].mime_type.starts_with("text/html"));
        assert_eq!(responses[1].delay, Duration::from_millis(20));
    }
}
