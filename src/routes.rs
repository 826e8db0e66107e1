//! Routing table: public path prefixes bound to backend dial targets
//!
//! A [`RoutingTable`] is immutable once built. The synchronizer compiles a new
//! table on every pass and publishes it through a [`RouteTableHandle`]; each
//! request takes one snapshot and resolves against it, so a request never
//! sees a half-replaced set of routes.

use crate::inventory::ListenerDescriptor;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// How traffic on a route is carried to its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// Request/response forwarding (the dashboard)
    Http,
    /// Upgraded connection relayed frame by frame (data-plane listeners)
    WebSocket,
}

/// A gateway-side binding from a path prefix to a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub path_prefix: String,
    /// `host:port`
    pub dial_target: String,
    pub kind: RouteKind,
    /// Whether the Host header must match the public domain
    pub guarded: bool,
}

impl RouteEntry {
    /// The static dashboard route. An empty prefix matches every path.
    pub fn dashboard(path_prefix: impl Into<String>, dial_target: impl Into<String>, guarded: bool) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            dial_target: dial_target.into(),
            kind: RouteKind::Http,
            guarded,
        }
    }

    pub fn listener(listener: &ListenerDescriptor, backend_host: &str) -> Self {
        Self {
            path_prefix: listener.path_prefix.clone(),
            dial_target: format!("{}:{}", backend_host, listener.port),
            kind: RouteKind::WebSocket,
            guarded: false,
        }
    }

    /// Does `path` fall under this entry's prefix?
    fn covers(&self, path: &str) -> bool {
        if self.path_prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Counters from compiling a table
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompileStats {
    /// Listeners that replaced an earlier listener with the same path
    pub duplicates: usize,
    /// Listeners dropped because they collide with the dashboard prefix
    pub shadowed: usize,
}

/// The complete set of routes, keyed by path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    dashboard: RouteEntry,
    listeners: BTreeMap<String, RouteEntry>,
}

impl RoutingTable {
    /// A table holding only the dashboard route
    pub fn with_dashboard(dashboard: RouteEntry) -> Self {
        Self {
            dashboard,
            listeners: BTreeMap::new(),
        }
    }

    /// Build a table from the dashboard route and the listener inventory.
    ///
    /// Listeners sharing a path: the later one wins.
    pub fn compile(
        dashboard: RouteEntry,
        listeners: &[ListenerDescriptor],
        backend_host: &str,
    ) -> (Self, CompileStats) {
        let mut table = Self::with_dashboard(dashboard);
        let mut stats = CompileStats::default();

        for listener in listeners {
            if table.dashboard.covers(&listener.path_prefix) {
                warn!(
                    path = %listener.path_prefix,
                    port = listener.port,
                    dashboard = %table.dashboard.path_prefix,
                    "Listener path collides with the dashboard, ignoring"
                );
                stats.shadowed += 1;
                continue;
            }

            let entry = RouteEntry::listener(listener, backend_host);
            if let Some(previous) = table.listeners.insert(entry.path_prefix.clone(), entry) {
                warn!(
                    path = %previous.path_prefix,
                    replaced_target = %previous.dial_target,
                    port = listener.port,
                    "Duplicate listener path, keeping the later one"
                );
                stats.duplicates += 1;
            }
        }

        (table, stats)
    }

    pub fn dashboard(&self) -> &RouteEntry {
        &self.dashboard
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Total number of routes, dashboard included
    pub fn route_count(&self) -> usize {
        self.listeners.len() + 1
    }

    pub fn get(&self, path_prefix: &str) -> Option<&RouteEntry> {
        if path_prefix == self.dashboard.path_prefix {
            return Some(&self.dashboard);
        }
        self.listeners.get(path_prefix)
    }

    /// All routes, dashboard first, listeners in path order
    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        std::iter::once(&self.dashboard).chain(self.listeners.values())
    }

    /// Find the route serving `path`: an exact listener path first, then the
    /// dashboard prefix.
    pub fn resolve(&self, path: &str) -> Option<&RouteEntry> {
        if let Some(entry) = self.listeners.get(path) {
            return Some(entry);
        }
        self.dashboard.covers(path).then_some(&self.dashboard)
    }
}

/// Atomically swappable reference to the current table
pub struct RouteTableHandle {
    current: ArcSwap<RoutingTable>,
}

impl RouteTableHandle {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// The table to resolve one request against
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Replace the table, returning the previous one
    pub fn publish(&self, table: RoutingTable) -> Arc<RoutingTable> {
        self.current.swap(Arc::new(table))
    }
}
