use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use futures::future::join_all;
use portlens::{
    CaptureHandle, DiagnosticKind, EngineConfig, ErrorKind, ExtractResult, ExtractionEvent,
    ExtractionStage, NetworkEvent, PortAnalytics, ReplayResponse, ReplaySession, SessionClient,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn config() -> EngineConfig {
    EngineConfig {
        company_url_template: "https://site.test/company/{slug}".to_string(),
        capture_timeout_ms: 2_000,
        navigation_timeout_ms: 5_000,
        cache_ttl_secs: 60,
        ..EngineConfig::default()
    }
}

fn service(session: &Arc<ReplaySession>) -> PortAnalytics {
    PortAnalytics::new(Arc::<ReplaySession>::clone(session), config()).unwrap()
}

fn acme_capture() -> Vec<ReplayResponse> {
    vec![ReplayResponse::json(
        "https://site.test/api/company/acme",
        json!({
            "exit_ports": [
                {"port": "Ningbo", "shipments": 300},
                {"port": "Yantian", "shipments": 1250}
            ],
            "entry_ports": [{"port": "Long Beach", "shipments": "1,400"}],
            "lanes": [{"from": "Yantian", "to": "Long Beach", "shipments": 1100}]
        }),
    )
    .with_delay(Duration::from_millis(50))]
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_lookups_share_one_extraction() {
    let session = Arc::new(
        ReplaySession::new(acme_capture()).with_navigation_delay(Duration::from_millis(200)),
    );
    let service = service(&session);

    let names = ["Acme", "acme", " ACME ", "Acme", "aCmE"];
    let results = join_all(names.iter().map(|name| {
        let service = service.clone();
        async move { service.get_port_analytics(name).await }
    }))
    .await;

    assert_eq!(session.navigations(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        let analytics = result.as_ref().unwrap();
        assert!(Arc::ptr_eq(&analytics.result, &first.result));
    }
    assert_eq!(first.result.export_ports[0].port, "Yantian");
    assert_eq!(first.result.import_ports[0].shipments, 1400);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_share_one_report() {
    let session = Arc::new(ReplaySession::new(acme_capture()));
    session.set_navigation_delay(Duration::from_millis(100));
    session.set_navigation_error(Some("net::ERR_CONNECTION_RESET"));
    let service = service(&session);

    let (a, b) = tokio::join!(
        service.get_port_analytics("Acme"),
        service.get_port_analytics("acme")
    );
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert_eq!(a, b);
    assert_eq!(a.kind, ErrorKind::Navigation);
    assert_eq!(a.stage, ExtractionStage::Navigating);
    assert_eq!(session.navigations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_capture_is_returned_and_flagged() {
    let session = Arc::new(ReplaySession::new(vec![ReplayResponse::json(
        "https://site.test/api/exit_ports?company=acme",
        json!({"exit_ports": [{"port": "Yantian", "shipments": 12}]}),
    )]));
    let service = service(&session);
    let mut events = service.subscribe();

    let analytics = service.get_port_analytics("Acme").await.unwrap();
    let result = &analytics.result;
    assert!(result.partial);
    assert_eq!(result.export_ports.len(), 1);
    assert!(result.import_ports.is_empty());
    assert!(result.trade_lanes.is_empty());
    let timeouts: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::CaptureTimeout)
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(
        timeouts[0].message,
        "capture window of 2000ms closed before import_ports, trade_lanes were seen"
    );

    let mut saw_partial = false;
    while let Ok(event) = events.try_recv() {
        if let ExtractionEvent::CapturePartial { missing, .. } = event {
            assert_eq!(missing, vec!["import_ports", "trade_lanes"]);
            saw_partial = true;
        }
    }
    assert!(saw_partial);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_cached_value() {
    let session = Arc::new(ReplaySession::new(acme_capture()));
    let service = service(&session);

    let original = service.get_port_analytics("Acme").await.unwrap();
    session.set_navigation_error(Some("net::ERR_TIMED_OUT"));

    let report = service.refresh("Acme").await.unwrap_err();
    assert_eq!(report.kind, ErrorKind::Navigation);

    let again = service.get_port_analytics("Acme").await.unwrap();
    assert!(again.cached);
    assert!(Arc::ptr_eq(&again.result, &original.result));
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_extracted_again() {
    let session = Arc::new(ReplaySession::new(acme_capture()));
    let service = service(&session);

    assert!(!service.get_port_analytics("Acme").await.unwrap().cached);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(service.get_port_analytics("Acme").await.unwrap().cached);
    assert_eq!(session.navigations(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!service.get_port_analytics("Acme").await.unwrap().cached);
    assert_eq!(session.navigations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear_cache_forces_extraction() {
    let session = Arc::new(ReplaySession::new(acme_capture()));
    let service = service(&session);

    service.get_port_analytics("Acme").await.unwrap();
    assert_eq!(service.health_check().await.cache_size, 1);
    assert_eq!(service.clear_cache(), 1);
    assert_eq!(service.health_check().await.cache_size, 0);

    assert!(!service.get_port_analytics("Acme").await.unwrap().cached);
    assert_eq!(session.navigations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_response_becomes_diagnostic() {
    let session = Arc::new(ReplaySession::new(vec![
        ReplayResponse::json(
            "https://site.test/api/exit_ports",
            json!({"exit_ports": [{"port": "Yantian", "shipments": 5}]}),
        ),
        ReplayResponse::json(
            "https://site.test/api/entry_ports",
            json!({"entry_ports": [{"port": "Oakland", "shipments": 4}]}),
        ),
        ReplayResponse::raw("https://site.test/api/lanes", "application/json", "{broken"),
    ]));
    let service = service(&session);

    let result = service.get_port_analytics("Acme").await.unwrap().result;
    assert!(result.partial);
    assert!(result.trade_lanes.is_empty());
    assert!(!result
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::CaptureTimeout));
    let decode_errors: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::DecodeError)
        .collect();
    assert_eq!(decode_errors.len(), 1);
    assert_eq!(
        decode_errors[0].url.as_deref(),
        Some("https://site.test/api/lanes")
    );
}

#[tokio::test(start_paused = true)]
async fn test_nothing_captured_is_empty_result() {
    let session = Arc::new(ReplaySession::default());
    let service = service(&session);

    let report = service.get_port_analytics("Nobody Inc").await.unwrap_err();
    assert_eq!(report.kind, ErrorKind::EmptyResult);
    assert_eq!(report.stage, ExtractionStage::Normalizing);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::CaptureTimeout));
    assert_eq!(session.visited(), vec!["https://site.test/company/nobody-inc"]);
}

#[tokio::test(start_paused = true)]
async fn test_offline_browser_is_connection_failure() {
    let session = Arc::new(ReplaySession::new(acme_capture()));
    session.set_reachable(false);
    let service = service(&session);

    let report = service.get_port_analytics("Acme").await.unwrap_err();
    assert_eq!(report.kind, ErrorKind::Connection);
    assert_eq!(report.stage, ExtractionStage::Navigating);
    assert!(!service.health_check().await.browser_reachable);

    assert_json_eq!(
        serde_json::to_value(&report).unwrap(),
        json!({
            "company": "Acme",
            "kind": "connection",
            "stage": "navigating",
            "message": "Cannot reach browser debugging endpoint: replay browser is offline",
            "diagnostics": []
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_page_document_fills_missing_categories() {
    let page = r#"<html><body>
        <h2>Top Ports Shipped From</h2>
        <table>
          <tr><td>Yantian, China</td><td>1,250</td></tr>
          <tr><td>Ningbo, China</td><td>300</td></tr>
        </table>
        <h2>Top lanes used</h2>
        <ul><li>Yantian → Long Beach 40</li></ul>
        </body></html>"#;
    let session = Arc::new(ReplaySession::new(vec![
        ReplayResponse::html("https://site.test/company/globex", page),
        ReplayResponse::gzip_json(
            "https://site.test/data/entry_ports",
            json!({"entry_ports": [{"port": "Long Beach", "shipments": 980}]}),
        )
        .with_delay(Duration::from_millis(20)),
    ]));
    let service = service(&session);

    let result = service.get_port_analytics("Globex").await.unwrap().result;
    assert!(!result.partial);
    let wire = serde_json::to_value(result.as_ref()).unwrap();
    assert_eq!(
        wire["export_ports"],
        json!([
            {"port": "Yantian, China", "shipments": 1250},
            {"port": "Ningbo, China", "shipments": 300}
        ])
    );
    assert_eq!(
        wire["import_ports"],
        json!([{"port": "Long Beach", "shipments": 980}])
    );
    assert_eq!(
        wire["trade_lanes"],
        json!([{"exit_port": "Yantian", "entry_port": "Long Beach", "shipments": 40}])
    );
}

#[tokio::test(start_paused = true)]
async fn test_category_endpoints_arriving_in_waves_are_all_kept() {
    let session = Arc::new(ReplaySession::new(vec![
        ReplayResponse::json(
            "https://site.test/api/company/acme/exit-ports",
            json!([{"port": "Yantian", "shipments": 12}]),
        )
        .with_delay(Duration::from_millis(10)),
        ReplayResponse::json(
            "https://site.test/api/company/acme/entry-ports",
            json!([{"port": "Long Beach", "shipments": 9}]),
        )
        .with_delay(Duration::from_millis(100)),
        ReplayResponse::json(
            "https://site.test/api/company/acme/lanes",
            json!([{"from": "Yantian", "to": "Long Beach", "shipments": 7}]),
        )
        .with_delay(Duration::from_millis(200)),
    ]));
    let config = EngineConfig {
        capture_timeout_ms: 5_000,
        ..config()
    };
    let service = PortAnalytics::new(session, config).unwrap();

    let started = Instant::now();
    let result = service.get_port_analytics("Acme").await.unwrap().result;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!result.partial);
    assert_eq!(result.export_ports[0].port, "Yantian");
    assert_eq!(result.import_ports[0].port, "Long Beach");
    assert_eq!(result.trade_lanes[0].shipments, 7);
}

#[tokio::test(start_paused = true)]
async fn test_company_page_alone_completes_extraction() {
    let page = r#"<html><body>
        <h2>Top Ports Shipped From</h2>
        <table><tr><td>Yantian, China</td><td>1,250</td></tr></table>
        <h2>Top Ports Shipped To</h2>
        <table><tr><td>Long Beach, California</td><td>980</td></tr></table>
        <h2>Top lanes used</h2>
        <ul><li>Yantian → Long Beach 40</li></ul>
        </body></html>"#;
    let session = Arc::new(ReplaySession::new(vec![ReplayResponse::html(
        "https://site.test/company/acme",
        page,
    )
    .with_delay(Duration::from_millis(40))]));
    let config = EngineConfig {
        capture_timeout_ms: 5_000,
        ..config()
    };
    let service = PortAnalytics::new(session, config).unwrap();

    let started = Instant::now();
    let result = service.get_port_analytics("Acme").await.unwrap().result;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!result.partial);
    assert!(!result
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::CaptureTimeout));
    assert_eq!(result.export_ports.len(), 1);
    assert_eq!(result.import_ports.len(), 1);
    assert_eq!(result.trade_lanes.len(), 1);
}

/// Counts capture windows that are open at the same time.
struct WindowCounter {
    inner: Arc<ReplaySession>,
    open: Mutex<Vec<mpsc::UnboundedSender<NetworkEvent>>>,
    peak: AtomicUsize,
}

impl WindowCounter {
    fn new(inner: Arc<ReplaySession>) -> Self {
        Self {
            inner,
            open: Mutex::new(Vec::new()),
            peak: AtomicUsize::new(0),
        }
    }

    fn observe(&self, opened: Option<mpsc::UnboundedSender<NetworkEvent>>) {
        let mut open = self.open.lock().unwrap();
        open.retain(|tx| !tx.is_closed());
        open.extend(opened);
        self.peak.fetch_max(open.len(), Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionClient for WindowCounter {
    async fn begin_capture(&self) -> ExtractResult<CaptureHandle> {
        let mut inner = self.inner.begin_capture().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.observe(Some(tx.clone()));
        let forwarder = tokio::spawn(async move {
            while let Some(event) = inner.next_event().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(CaptureHandle::new(rx).with_forwarder(forwarder.abort_handle()))
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> ExtractResult<()> {
        self.observe(None);
        self.inner.navigate(url, timeout).await?;
        self.observe(None);
        Ok(())
    }

    async fn response_body(&self, request_id: &str) -> ExtractResult<Vec<u8>> {
        self.observe(None);
        self.inner.response_body(request_id).await
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_different_companies_take_turns_on_the_browser() {
    let replay = Arc::new(
        ReplaySession::new(acme_capture()).with_navigation_delay(Duration::from_millis(100)),
    );
    let counter = Arc::new(WindowCounter::new(Arc::clone(&replay)));
    let service = PortAnalytics::new(Arc::clone(&counter) as Arc<dyn SessionClient>, config()).unwrap();

    let (acme, globex) = tokio::join!(
        service.get_port_analytics("Acme"),
        service.get_port_analytics("Globex")
    );
    assert!(acme.is_ok());
    assert!(globex.is_ok());
    assert_eq!(replay.navigations(), 2);
    assert_eq!(counter.peak(), 1);

    let mut visited = replay.visited();
    visited.sort();
    assert_eq!(
        visited,
        vec![
            "https://site.test/company/acme".to_string(),
            "https://site.test/company/globex".to_string()
        ]
    );
}
