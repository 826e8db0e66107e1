//! Route synchronization
//!
//! Turns the panel's listener inventory into a fresh [`RoutingTable`] and
//! publishes it in one swap.

use crate::error::PanelResult;
use crate::inventory::{InventoryFetcher, ListenerInventory};
use crate::routes::{RouteEntry, RouteTableHandle, RoutingTable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one synchronization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Listeners reported by the panel
    pub listeners: usize,
    /// Routes in the published table, dashboard included
    pub routes: usize,
    pub duplicates: usize,
    /// The inventory could not be read and only the dashboard is routed
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct SyncStatusInner {
    last_success: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
    passes: u64,
    failures: u64,
    routes: usize,
}

/// Point-in-time view of [`SyncStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusSnapshot {
    pub last_success_at: Option<DateTime<Utc>>,
    pub seconds_since_success: Option<u64>,
    pub passes: u64,
    pub failures: u64,
    pub routes: usize,
}

/// Tracks how recently synchronization last succeeded
#[derive(Debug, Default)]
pub struct SyncStatus {
    inner: Mutex<SyncStatusInner>,
}

impl SyncStatus {
    pub fn record_success(&self, report: &SyncReport) {
        let mut inner = self.inner.lock();
        inner.last_success = Some(Instant::now());
        inner.last_success_at = Some(Utc::now());
        inner.passes += 1;
        inner.routes = report.routes;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.passes += 1;
        inner.failures += 1;
    }

    /// Healthy while the last successful pass is younger than `max_staleness`
    pub fn is_healthy(&self, max_staleness: Duration) -> bool {
        self.inner
            .lock()
            .last_success
            .is_some_and(|at| at.elapsed() <= max_staleness)
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        let inner = self.inner.lock();
        SyncStatusSnapshot {
            last_success_at: inner.last_success_at,
            seconds_since_success: inner.last_success.map(|at| at.elapsed().as_secs()),
            passes: inner.passes,
            failures: inner.failures,
            routes: inner.routes,
        }
    }
}

/// Rebuilds and publishes the routing table from the panel inventory
pub struct RouteSynchronizer {
    /// None in setup mode, where no listener routes exist
    fetcher: Option<Arc<InventoryFetcher>>,
    table: Arc<RouteTableHandle>,
    dashboard: RouteEntry,
    backend_host: String,
    status: Arc<SyncStatus>,
}

impl RouteSynchronizer {
    pub fn new(
        fetcher: Option<Arc<InventoryFetcher>>,
        table: Arc<RouteTableHandle>,
        dashboard: RouteEntry,
        backend_host: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            table,
            dashboard,
            backend_host: backend_host.into(),
            status: Arc::new(SyncStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        Arc::clone(&self.status)
    }

    pub fn table(&self) -> Arc<RouteTableHandle> {
        Arc::clone(&self.table)
    }

    /// Run one pass. Safe to call repeatedly.
    ///
    /// An unreadable inventory publishes a dashboard-only table; a session
    /// that cannot be established leaves the current table in place and is
    /// returned as an error.
    pub async fn synchronize(&self) -> PanelResult<SyncReport> {
        let Some(fetcher) = &self.fetcher else {
            let table = RoutingTable::with_dashboard(self.dashboard.clone());
            let report = SyncReport {
                listeners: 0,
                routes: table.route_count(),
                duplicates: 0,
                degraded: false,
            };
            self.table.publish(table);
            self.status.record_success(&report);
            debug!("Setup mode, dashboard route only");
            return Ok(report);
        };

        let ListenerInventory { listeners, degraded } = match fetcher.fetch_listeners().await {
            Ok(inventory) => inventory,
            Err(e) => {
                self.status.record_failure();
                error!(error = %e, "Synchronization aborted, keeping current routes");
                return Err(e);
            }
        };

        let (table, stats) =
            RoutingTable::compile(self.dashboard.clone(), &listeners, &self.backend_host);
        let report = SyncReport {
            listeners: listeners.len(),
            routes: table.route_count(),
            duplicates: stats.duplicates,
            degraded,
        };

        let previous = self.table.publish(table);

        if degraded {
            self.status.record_failure();
        } else {
            self.status.record_success(&report);
        }

        if report.listeners == 0 {
            warn!(degraded, "No listeners available, routing the dashboard only");
        }
        info!(
            listeners = report.listeners,
            routes = report.routes,
            previous_routes = previous.route_count(),
            duplicates = report.duplicates,
            "Routing table published"
        );

        Ok(report)
    }

    /// Re-synchronize every `interval` until shutdown
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Route synchronizer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.synchronize().await {
                        error!(error = %e, "Periodic synchronization failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Route synchronizer shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(routes: usize) -> SyncReport {
        SyncReport {
            listeners: routes.saturating_sub(1),
            routes,
            duplicates: 0,
            degraded: false,
        }
    }

    #[test]
    fn test_status_starts_unhealthy() {
        let status = SyncStatus::default();
        assert!(!status.is_healthy(Duration::from_secs(60)));
        assert_eq!(status.snapshot().passes, 0);
    }

    #[test]
    fn test_status_after_success() {
        let status = SyncStatus::default();
        status.record_success(&report(3));

        assert!(status.is_healthy(Duration::from_secs(60)));
        let snapshot = status.snapshot();
        assert_eq!(snapshot.passes, 1);
        assert_eq!(snapshot.routes, 3);
        assert!(snapshot.last_success_at.is_some());
    }

    #[test]
    fn test_failures_do_not_refresh_health() {
        let status = SyncStatus::default();
        status.record_failure();
        status.record_failure();

        assert!(!status.is_healthy(Duration::from_secs(60)));
        let snapshot = status.snapshot();
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.seconds_since_success, None);
    }

    #[tokio::test]
    async fn test_setup_mode_publishes_dashboard_only() {
        let dashboard = RouteEntry::dashboard("", "10.0.0.2:54321", false);
        let table = Arc::new(RouteTableHandle::new(RoutingTable::with_dashboard(dashboard.clone())));
        let sync = RouteSynchronizer::new(None, Arc::clone(&table), dashboard, "10.0.0.2");

        let report = sync.synchronize().await.unwrap();
        assert_eq!(report.routes, 1);
        assert!(!report.degraded);
        assert_eq!(table.snapshot().route_count(), 1);
        assert!(sync.status().is_healthy(Duration::from_secs(1)));
    }
}
