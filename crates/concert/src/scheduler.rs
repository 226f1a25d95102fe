//! Reconcile triggers
//!
//! Two tasks feed the same [`ReconcileEngine`]:
//!
//! - a periodic timer that lists the catalog once per interval
//! - a catalog watch that long-polls for changes and reconciles against the
//!   services it receives
//!
//! Both stop at their next suspension point once the shutdown token is
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domains::select_from_catalog;
use crate::kv::{ServiceCatalog, ServiceMap};
use crate::reconcile::{ReconcileEngine, ReconcileError, ReconcileReport};

/// First delay after a failed watch request
const WATCH_RETRY_MIN: Duration = Duration::from_secs(1);

/// Longest delay between failed watch requests
const WATCH_RETRY_MAX: Duration = Duration::from_secs(60);

/// What caused a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Periodic,
    CatalogChange,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Periodic => f.write_str("periodic"),
            Trigger::CatalogChange => f.write_str("catalog-change"),
        }
    }
}

/// Runs reconcile passes on a timer and on catalog changes
pub struct ReconcileScheduler {
    engine: Arc<ReconcileEngine>,
    catalog: Arc<dyn ServiceCatalog>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl ReconcileScheduler {
    pub fn new(
        engine: Arc<ReconcileEngine>,
        catalog: Arc<dyn ServiceCatalog>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            catalog,
            interval,
            shutdown,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run both trigger tasks until shutdown
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconcile scheduler"
        );

        let periodic = tokio::spawn(self.clone().run_periodic());
        let watch = tokio::spawn(self.clone().run_watch());

        for (name, handle) in [("periodic", periodic), ("watch", watch)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Reconcile task panicked");
            }
        }

        info!("Reconcile scheduler stopped");
    }

    /// Reconcile every interval; the first pass happens one interval in
    pub async fn run_periodic(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Periodic reconcile task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let result = self.reconcile_catalog().await;
                    log_outcome(Trigger::Periodic, result);
                }
            }
        }
    }

    /// Reconcile whenever the catalog index moves
    pub async fn run_watch(self: Arc<Self>) {
        let mut last_index = 0;
        let mut retry = WATCH_RETRY_MIN;

        loop {
            let update = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Catalog watch task shutting down");
                    break;
                }
                update = self.catalog.watch_services(last_index) => update,
            };

            match update {
                Ok(update) => {
                    retry = WATCH_RETRY_MIN;
                    if update.index == last_index {
                        continue;
                    }
                    // An index that goes backwards means the catalog was reset
                    last_index = if update.index < last_index { 0 } else { update.index };

                    debug!(index = update.index, services = update.services.len(), "Catalog changed");
                    let result = self.reconcile_services(&update.services).await;
                    log_outcome(Trigger::CatalogChange, result);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_secs = retry.as_secs(),
                        "Catalog watch failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry) => {}
                    }
                    retry = (retry * 2).min(WATCH_RETRY_MAX);
                }
            }
        }
    }

    /// List the catalog and reconcile against it
    pub async fn reconcile_catalog(&self) -> Result<ReconcileReport, ReconcileError> {
        let services = self.catalog.list_services().await?;
        self.reconcile_services(&services).await
    }

    /// Reconcile against an already fetched catalog snapshot
    pub async fn reconcile_services(
        &self,
        services: &ServiceMap,
    ) -> Result<ReconcileReport, ReconcileError> {
        let domains = select_from_catalog(services);
        self.engine.reconcile(&domains).await
    }
}

fn log_outcome(trigger: Trigger, result: Result<ReconcileReport, ReconcileError>) {
    match result {
        Ok(report) if report.is_clean() => {
            debug!(trigger = %trigger, issued = report.issued.len(), "Reconcile pass clean");
        }
        Ok(report) => {
            let failed: Vec<&str> = report.failed.iter().map(|(d, _)| d.as_str()).collect();
            warn!(
                trigger = %trigger,
                failed = ?failed,
                "Reconcile pass finished with failures, retrying on next trigger"
            );
        }
        Err(e) => {
            error!(trigger = %trigger, error = %e, "Reconcile pass aborted");
        }
    }
}

impl std::fmt::Debug for ReconcileScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileScheduler")
            .field("interval", &self.interval)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::CertificateStore;
    use crate::kv::{MemoryBackend, ServiceMap};
    use crate::testing::FakeAuthority;

    fn scheduler(
        interval: Duration,
    ) -> (Arc<MemoryBackend>, Arc<FakeAuthority>, Arc<ReconcileScheduler>) {
        let backend = Arc::new(MemoryBackend::new());
        let authority = Arc::new(FakeAuthority::new());
        let engine = Arc::new(ReconcileEngine::new(
            authority.clone(),
            CertificateStore::new(backend.clone(), "concert/certs"),
            Duration::from_secs(720 * 3600),
            Duration::from_secs(5),
        ));
        let scheduler = Arc::new(ReconcileScheduler::new(
            engine,
            backend.clone(),
            interval,
            CancellationToken::new(),
        ));
        (backend, authority, scheduler)
    }

    async fn wait_for_attempts(authority: &FakeAuthority, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while authority.attempts().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("authority was not asked in time");
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::Periodic.to_string(), "periodic");
        assert_eq!(Trigger::CatalogChange.to_string(), "catalog-change");
    }

    #[tokio::test]
    async fn test_reconcile_catalog() {
        let (backend, authority, scheduler) = scheduler(Duration::from_secs(3600));
        backend.register_service("web", &["concert-api.example.com", "http"]);

        let report = scheduler.reconcile_catalog().await.unwrap();

        assert_eq!(report.issued, vec!["api.example.com"]);
        assert_eq!(authority.attempts(), vec!["api.example.com"]);
    }

    #[tokio::test]
    async fn test_reconcile_catalog_fails_when_catalog_unavailable() {
        let (backend, _authority, scheduler) = scheduler(Duration::from_secs(3600));
        backend.set_offline(true);

        let result = scheduler.reconcile_catalog().await;
        assert!(matches!(result, Err(ReconcileError::Catalog(_))));
    }

    #[tokio::test]
    async fn test_watch_reconciles_on_change() {
        let (backend, authority, scheduler) = scheduler(Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.clone().run_watch());

        backend.register_service("web", &["concert-a.example.com"]);
        wait_for_attempts(&authority, 1).await;

        backend.register_service("admin", &["concert-b.example.com"]);
        wait_for_attempts(&authority, 2).await;

        scheduler.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let attempts = authority.attempts();
        assert!(attempts.contains(&"a.example.com".to_string()));
        assert!(attempts.contains(&"b.example.com".to_string()));
        assert_eq!(
            attempts.iter().filter(|d| *d == "a.example.com").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_waits_one_interval() {
        let (backend, authority, scheduler) = scheduler(Duration::from_secs(60));
        backend.register_service("web", &["concert-api.example.com"]);
        let task = tokio::spawn(scheduler.clone().run_periodic());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(authority.attempts().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(authority.attempts(), vec!["api.example.com"]);

        scheduler.shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_recovers_after_offline_tick() {
        let (backend, authority, scheduler) = scheduler(Duration::from_secs(60));
        backend.register_service("web", &["concert-api.example.com"]);
        backend.set_offline(true);
        let task = tokio::spawn(scheduler.clone().run_periodic());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(authority.attempts().is_empty());

        backend.set_offline(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(authority.attempts(), vec!["api.example.com"]);

        scheduler.shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_recovers_after_backend_outage() {
        let (backend, authority, scheduler) = scheduler(Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.clone().run_watch());

        backend.register_service("web", &["concert-a.example.com"]);
        wait_for_attempts(&authority, 1).await;

        // The change is delivered but the pass and the next watch fail
        backend.set_offline(true);
        backend.register_service("admin", &["concert-b.example.com"]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(authority.attempts(), vec!["a.example.com"]);

        backend.set_offline(false);
        backend.register_service("api", &["concert-c.example.com"]);
        wait_for_attempts(&authority, 3).await;

        scheduler.shutdown.cancel();
        task.await.unwrap();

        assert_eq!(
            authority.attempts(),
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[tokio::test]
    async fn test_watch_follows_index_reset() {
        let (backend, authority, scheduler) = scheduler(Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.clone().run_watch());

        backend.register_service("web", &["concert-a.example.com"]);
        wait_for_attempts(&authority, 1).await;
        let seen = backend.catalog_index();

        let mut restored = ServiceMap::new();
        restored.insert("web".to_string(), vec!["concert-a.example.com".to_string()]);
        restored.insert("admin".to_string(), vec!["concert-b.example.com".to_string()]);
        backend.restore_catalog(seen - 1, restored);
        wait_for_attempts(&authority, 2).await;

        // Lands on the index seen before the reset
        backend.register_service("api", &["concert-c.example.com"]);
        assert_eq!(backend.catalog_index(), seen);
        wait_for_attempts(&authority, 3).await;

        scheduler.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            authority.attempts(),
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_backend, _authority, scheduler) = scheduler(Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.clone().run());

        scheduler.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
