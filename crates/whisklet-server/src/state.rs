use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use whisklet_core::registry::RouteTable;
use whisklet_core::sandbox::Sandbox;

/// Shared application state passed to all route handlers.
///
/// The route table and global environment are read-only after startup; the
/// sandbox owns the warm instance cache. The invocation counter exists for
/// observability (and lets tests assert that OPTIONS never reaches an action).
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<RouteTable>,
    pub sandbox: Sandbox,
    pub global_env: Arc<BTreeMap<String, String>>,
    invocations: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(table: RouteTable, global_env: BTreeMap<String, String>) -> Self {
        Self {
            table: Arc::new(table),
            sandbox: Sandbox::new(),
            global_env: Arc::new(global_env),
            invocations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}
