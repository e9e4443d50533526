// Per-tenant usage counters started before a connection is advertised.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct TenantUsage {
    started_at: Instant,
    events: AtomicU64,
    joins: AtomicU64,
    db_events: AtomicU64,
    presence_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TenantUsageSnapshot {
    pub events: u64,
    pub joins: u64,
    pub db_events: u64,
    pub presence_events: u64,
}

impl TenantUsage {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            db_events: AtomicU64::new(0),
            presence_events: AtomicU64::new(0),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join(&self) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_db_event(&self) {
        self.db_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presence_event(&self) {
        self.presence_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TenantUsageSnapshot {
        TenantUsageSnapshot {
            events: self.events.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            db_events: self.db_events.load(Ordering::Relaxed),
            presence_events: self.presence_events.load(Ordering::Relaxed),
        }
    }
}

/// Node-local table of tenant usage counters.
#[derive(Debug, Clone, Default)]
pub struct TenantCounters {
    inner: Arc<Mutex<HashMap<String, Arc<TenantUsage>>>>,
}

impl TenantCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counters for a tenant. Idempotent: a second start returns the
    /// already running counters.
    pub fn start(&self, tenant_id: &str) -> Arc<TenantUsage> {
        let mut guard = self.inner.lock();
        let usage = Arc::clone(
            guard
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(TenantUsage::new())),
        );
        metrics::gauge!("ember_tenant_counters").set(guard.len() as f64);
        usage
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantUsage>> {
        self.inner.lock().get(tenant_id).cloned()
    }

    pub fn clear(&self, tenant_id: &str) -> bool {
        let mut guard = self.inner.lock();
        let removed = guard.remove(tenant_id).is_some();
        metrics::gauge!("ember_tenant_counters").set(guard.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_idempotent() {
        let counters = TenantCounters::new();
        let first = counters.start("t1");
        first.record_event();
        let second = counters.start("t1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().events, 1);
        assert_eq!(counters.len(), 1);
    }

    #[test]
    fn start_keeps_tenants_apart() {
        let counters = TenantCounters::new();
        let t1 = counters.start("t1");
        let t2 = counters.start("t2");
        t1.record_event();
        assert!(!Arc::ptr_eq(&t1, &t2));
        assert_eq!(t2.snapshot().events, 0);
        assert_eq!(counters.len(), 2);
        assert!(counters.clear("t1"));
        assert!(counters.get("t2").is_some());
    }

    #[test]
    fn clear_drops_tenant_counters() {
        let counters = TenantCounters::new();
        let usage = counters.start("t1");
        usage.record_join();
        usage.record_db_event();
        usage.record_presence_event();
        assert_eq!(
            usage.snapshot(),
            TenantUsageSnapshot {
                events: 0,
                joins: 1,
                db_events: 1,
                presence_events: 1,
            }
        );
        assert!(counters.clear("t1"));
        assert!(!counters.clear("t1"));
        assert!(counters.get("t1").is_none());
        assert!(counters.is_empty());
    }
}
