//! Schema Model & Registry: the catalog of tables/columns per tenant.
//!
//! Per-tenant mapping from table identifier to [`TableSchema`], refreshed
//! on a TTL against the read-side stores. Read-mostly: refreshes must never
//! block concurrent readers, so we hold the per-tenant map behind a
//! `parking_lot::RwLock`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use vizql_types::{TableSchema, TenantId};

#[derive(Clone)]
struct CatalogEntry {
    tables: Arc<HashMap<String, TableSchema>>,
    fetched_at: Instant,
}

/// A pluggable source of per-tenant table metadata. Implementations talk to
/// the OLAP/stream/KV stores' own metadata endpoints; this trait is what
/// keeps the catalog's refresh logic testable without live stores.
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_tables(&self, tenant: &TenantId) -> Vec<TableSchema>;
}

/// Per-tenant table catalog with TTL-bounded refresh.
///
/// Invariant: a tenant never observes another tenant's tables —
/// enforced structurally here since the map is keyed by [`TenantId`] and
/// every lookup takes one explicitly; there is no "current tenant" global.
pub struct Catalog {
    source: Arc<dyn CatalogSource>,
    ttl: Duration,
    entries: RwLock<HashMap<TenantId, CatalogEntry>>,
}

impl Catalog {
    pub fn new(source: Arc<dyn CatalogSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up a table for `tenant`, refreshing from `source` first if the
    /// cached entry is absent or stale. Concurrent readers for other
    /// tenants are never blocked by this refresh.
    pub async fn lookup_table(&self, tenant: &TenantId, table: &str) -> Option<TableSchema> {
        if let Some(entry) = self.fresh_entry(tenant) {
            return entry.tables.get(table).cloned();
        }
        let refreshed = self.refresh(tenant).await;
        refreshed.get(table).cloned()
    }

    pub async fn all_tables(&self, tenant: &TenantId) -> Arc<HashMap<String, TableSchema>> {
        if let Some(entry) = self.fresh_entry(tenant) {
            return entry.tables;
        }
        Arc::new(self.refresh(tenant).await)
    }

    fn fresh_entry(&self, tenant: &TenantId) -> Option<CatalogEntry> {
        let entries = self.entries.read();
        entries.get(tenant).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.clone())
            } else {
                None
            }
        })
    }

    async fn refresh(&self, tenant: &TenantId) -> HashMap<String, TableSchema> {
        let fetched = self.source.fetch_tables(tenant).await;
        let tables: HashMap<String, TableSchema> =
            fetched.into_iter().map(|t| (t.name.clone(), t)).collect();
        let entry = CatalogEntry {
            tables: Arc::new(tables.clone()),
            fetched_at: Instant::now(),
        };
        self.entries.write().insert(tenant.clone(), entry);
        tables
    }

    /// Explicit invalidation, e.g. when an upstream schema change bumps a
    /// tenant-scoped generation counter.
    pub fn invalidate(&self, tenant: &TenantId) {
        self.entries.write().remove(tenant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vizql_types::{ColumnSchema, DType, StoreKind};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CatalogSource for CountingSource {
        async fn fetch_tables(&self, _tenant: &TenantId) -> Vec<TableSchema> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![TableSchema {
                name: "trades".to_string(),
                database: "default".to_string(),
                source: StoreKind::Olap,
                columns: vec![ColumnSchema::new("symbol", DType::String, false)],
            }]
        }
    }

    #[tokio::test]
    async fn tenants_never_observe_each_others_tables() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let catalog = Catalog::new(source, Duration::from_secs(60));
        let a = TenantId("a".to_string());
        let b = TenantId("b".to_string());
        let a_tables = catalog.all_tables(&a).await;
        let b_tables = catalog.all_tables(&b).await;
        assert!(a_tables.contains_key("trades"));
        assert!(b_tables.contains_key("trades"));
        assert!(!std::ptr::eq(Arc::as_ptr(&a_tables), Arc::as_ptr(&b_tables)));
    }

    #[tokio::test]
    async fn refresh_only_happens_once_within_ttl() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let catalog = Catalog::new(source.clone(), Duration::from_secs(60));
        let tenant = TenantId("a".to_string());
        catalog.lookup_table(&tenant, "trades").await;
        catalog.lookup_table(&tenant, "trades").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let catalog = Catalog::new(source.clone(), Duration::from_secs(60));
        let tenant = TenantId("a".to_string());
        catalog.lookup_table(&tenant, "trades").await;
        catalog.invalidate(&tenant);
        catalog.lookup_table(&tenant, "trades").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
