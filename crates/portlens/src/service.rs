//! `PortAnalytics`: the operations the serving layer calls.

use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::events::{EventBus, ExtractionEvent};
use crate::orchestrator::{Analytics, LookupMode, Orchestrator};
use crate::session::chromium::ChromiumSession;
use crate::session::SessionClient;
use crate::types::{CompanyQuery, ExtractResult, ExtractionStage, FailureReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Browser and cache status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub browser_reachable: bool,
    pub cache_size: usize,
}

/// Cache-first company analytics backed by a browser session.
#[derive(Clone)]
pub struct PortAnalytics {
    orchestrator: Orchestrator,
}

impl PortAnalytics {
    /// Build the service over an injected session.
    pub fn new(session: Arc<dyn SessionClient>, config: EngineConfig) -> ExtractResult<Self> {
        let cache = Arc::new(CacheStore::new(config.cache_ttl()));
        let orchestrator = Orchestrator::new(session, cache, config, EventBus::default())?;
        Ok(Self { orchestrator })
    }

    /// Build the service over the configured DevTools endpoint. The browser
    /// is attached on first use, so this succeeds while it is still down.
    pub fn connect(config: EngineConfig) -> ExtractResult<Self> {
        let session = Arc::new(ChromiumSession::lazy(&config.debugger_endpoint));
        Self::new(session, config)
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    /// Cached analytics for `company`, extracting on a miss or expiry.
    pub async fn get_port_analytics(&self, company: &str) -> Result<Analytics, FailureReport> {
        let query = parse(company)?;
        self.orchestrator.lookup(&query, LookupMode::CacheFirst).await
    }

    /// Re-extract `company` regardless of the cache. On failure the
    /// previously cached value stays in place.
    pub async fn refresh(&self, company: &str) -> Result<Analytics, FailureReport> {
        let query = parse(company)?;
        self.orchestrator.lookup(&query, LookupMode::Refresh).await
    }

    /// Drop every cached result. Returns how many entries were removed.
    pub fn clear_cache(&self) -> usize {
        let entries = self.orchestrator.cache().invalidate_all();
        tracing::info!("cache cleared: {entries} entries");
        self.orchestrator
            .events()
            .emit(ExtractionEvent::CacheCleared { entries });
        entries
    }

    pub async fn health_check(&self) -> Health {
        Health {
            browser_reachable: self.orchestrator.session().ping().await,
            cache_size: self.orchestrator.cache().len(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtractionEvent> {
        self.orchestrator.events().subscribe()
    }

    /// Periodically purge expired cache entries until `shutdown` fires.
    pub fn spawn_maintenance(
        &self,
        every: Duration,
        shutdown: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self.orchestrator.cache());
        tokio::spawn(async move {
            tracing::info!("maintenance loop started: tick={}s", every.as_secs());
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("maintenance loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            tracing::info!("maintenance purged {removed} expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

fn parse(company: &str) -> Result<CompanyQuery, FailureReport> {
    CompanyQuery::parse(company)
        .map_err(|e| FailureReport::new(company.trim(), ExtractionStage::Idle, &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::replay::ReplaySession;
    use crate::types::ErrorKind;

    #[tokio::test]
    async fn test_blank_company_is_invalid() {
        let service = PortAnalytics::new(Arc::new(ReplaySession::default()), EngineConfig::default())
            .unwrap();
        let report = service.get_port_analytics("   ").await.unwrap_err();
        assert_eq!(report.kind, ErrorKind::InvalidQuery);
        assert_eq!(report.stage, ExtractionStage::Idle);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            cache_ttl_secs: 0,
            ..EngineConfig::default()
        };
        let err = PortAnalytics::new(Arc::new(ReplaySession::default()), config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_health_reports_browser_state() {
        let session = Arc::new(ReplaySession::default());
        let service = PortAnalytics::new(session.clone(), EngineConfig::default()).unwrap();
        assert_eq!(
            service.health_check().await,
            Health {
                browser_reachable: true,
                cache_size: 0
            }
        );
        session.set_reachable(false);
        assert!(!service.health_check().await.browser_reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_purges_and_stops() {
        use crate::types::CompanyResult;
        let config = EngineConfig {
            cache_ttl_secs: 5,
            ..EngineConfig::default()
        };
        let service = PortAnalytics::new(Arc::new(ReplaySession::default()), config).unwrap();
        let cache = service.orchestrator.cache();
        cache.put_default(
            &CompanyQuery::parse("Acme").unwrap(),
            Arc::new(CompanyResult {
                company: "Acme".to_string(),
                export_ports: vec![],
                import_ports: vec![],
                trade_lanes: vec![],
                extracted_at: chrono::Utc::now(),
                partial: false,
                diagnostics: vec![],
            }),
        );

        let shutdown = Arc::new(Notify::new());
        let task = service.spawn_maintenance(Duration::from_secs(10), Arc::clone(&shutdown));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 0);

        shutdown.notify_one();
        task.await.unwrap();
    }
}
