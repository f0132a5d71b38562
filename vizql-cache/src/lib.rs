//! Preview/widget cache: content-addressed by [`RequestFingerprint`],
//! tenant-scoped, TTL-bounded, single-flight.
//!
//! The committed entries live in a `DashMap` (the same reader-writer
//! discipline `vizql-core::catalog` applies with `parking_lot::RwLock`,
//! sharded here since the cache is on the hot path for every preview/widget
//! request); a second `DashMap` of per-fingerprint `tokio::sync::Mutex`es
//! serializes concurrent misses onto exactly one compute call.

mod errors;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use vizql_types::errors::{CoreError, StoreError};
use vizql_types::{PreviewResult, RequestFingerprint, TenantId};

pub use errors::CacheConfigError;

#[derive(Clone)]
struct Entry {
    result: PreviewResult,
    expires_at: Instant,
    tenant: TenantId,
    tables: Arc<HashSet<String>>,
}

/// Per-fingerprint single-flight coordination primitive. Held for the
/// duration of one compile+execute; concurrent lookups for the same
/// fingerprint block on this mutex rather than each dispatching their
/// own store call.
type FlightLock = Arc<tokio::sync::Mutex<()>>;

pub struct PreviewCache {
    default_ttl: Duration,
    serve_stale_on_store_unavailable: bool,
    entries: DashMap<RequestFingerprint, Entry>,
    inflight: DashMap<RequestFingerprint, FlightLock>,
    /// Secondary index for tenant-scoped bulk invalidation, used when an
    /// upstream schema change bumps a tenant-scoped cache generation
    /// counter. Kept symmetric with `entries`: every insert adds here,
    /// every removal (TTL or explicit) removes here too.
    by_tenant: DashMap<TenantId, HashSet<RequestFingerprint>>,
}

impl PreviewCache {
    pub fn new(default_ttl: Duration, serve_stale_on_store_unavailable: bool) -> Self {
        Self {
            default_ttl,
            serve_stale_on_store_unavailable,
            entries: DashMap::new(),
            inflight: DashMap::new(),
            by_tenant: DashMap::new(),
        }
    }

    /// Looks up `fingerprint`; on a miss, serializes concurrent callers
    /// through the per-fingerprint flight lock and calls `compute` exactly
    /// once, storing its result for everyone waiting: N concurrent
    /// preview requests for the same fingerprint produce exactly one
    /// store call, and all N callers see the same result.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &RequestFingerprint,
        tenant: &TenantId,
        tables: HashSet<String>,
        compute: F,
    ) -> Result<PreviewResult, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<PreviewResult, CoreError>>,
    {
        if let Some(hit) = self.fresh_hit(fingerprint) {
            return Ok(hit);
        }

        let lock = self.flight_lock_for(fingerprint);
        let _guard = lock.lock().await;

        // Re-check: the caller that held the lock before us may have
        // already populated the entry while we waited on it.
        if let Some(hit) = self.fresh_hit(fingerprint) {
            self.drop_flight_lock_if_unused(fingerprint);
            return Ok(hit);
        }

        let outcome = compute().await;
        self.drop_flight_lock_if_unused(fingerprint);

        match outcome {
            Ok(mut result) => {
                result.cache_hit = false;
                result.stale = false;
                self.insert(fingerprint.clone(), tenant.clone(), tables, result.clone());
                Ok(result)
            }
            Err(CoreError::Store(StoreError::StoreUnavailable(store)))
                if self.serve_stale_on_store_unavailable =>
            {
                match self.stale_hit(fingerprint) {
                    Some(stale) => Ok(stale),
                    None => Err(CoreError::Store(StoreError::StoreUnavailable(store))),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn flight_lock_for(&self, fingerprint: &RequestFingerprint) -> FlightLock {
        self.inflight
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn drop_flight_lock_if_unused(&self, fingerprint: &RequestFingerprint) {
        let should_remove = self
            .inflight
            .get(fingerprint)
            .map(|lock| Arc::strong_count(&*lock) <= 1)
            .unwrap_or(false);
        if should_remove {
            self.inflight.remove(fingerprint);
        }
    }

    fn fresh_hit(&self, fingerprint: &RequestFingerprint) -> Option<PreviewResult> {
        let entry = self.entries.get(fingerprint)?;
        if entry.expires_at > Instant::now() {
            let mut result = entry.result.clone();
            result.cache_hit = true;
            result.stale = false;
            Some(result)
        } else {
            None
        }
    }

    /// Stale-serving policy: an expired entry may still be served,
    /// bounded to `2 * ttl` past expiry, when the store is unavailable
    /// and the policy opts in.
    fn stale_hit(&self, fingerprint: &RequestFingerprint) -> Option<PreviewResult> {
        let entry = self.entries.get(fingerprint)?;
        let staleness_bound = self.default_ttl * 2;
        if entry.expires_at.elapsed() <= staleness_bound {
            let mut result = entry.result.clone();
            result.cache_hit = false;
            result.stale = true;
            Some(result)
        } else {
            None
        }
    }

    fn insert(
        &self,
        fingerprint: RequestFingerprint,
        tenant: TenantId,
        tables: HashSet<String>,
        result: PreviewResult,
    ) {
        let entry = Entry {
            result,
            expires_at: Instant::now() + self.default_ttl,
            tenant: tenant.clone(),
            tables: Arc::new(tables),
        };
        self.entries.insert(fingerprint.clone(), entry);
        self.by_tenant
            .entry(tenant)
            .or_default()
            .insert(fingerprint);
    }

    /// Explicit tenant-scoped invalidation (e.g. a schema-change
    /// generation bump). Removes from both the primary map and the
    /// tenant index so the two never drift apart.
    pub fn invalidate_tenant(&self, tenant: &TenantId) {
        let fingerprints = self
            .by_tenant
            .remove(tenant)
            .map(|(_, set)| set)
            .unwrap_or_default();
        for fp in fingerprints {
            self.entries.remove(&fp);
        }
    }

    /// Invalidates every cached result whose declared dependent tables
    /// intersect `mutated_tables`.
    pub fn invalidate_tables(&self, mutated_tables: &HashSet<String>) {
        let mut evicted_tenants: Vec<(TenantId, RequestFingerprint)> = Vec::new();
        self.entries.retain(|fp, entry| {
            let hit = entry.tables.iter().any(|t| mutated_tables.contains(t));
            if hit {
                evicted_tenants.push((entry.tenant.clone(), fp.clone()));
            }
            !hit
        });
        for (tenant, fp) in evicted_tenants {
            if let Some(mut set) = self.by_tenant.get_mut(&tenant) {
                set.remove(&fp);
            }
        }
    }

    /// Best-effort TTL sweep; callers with no LRU ceiling requirement
    /// can run this periodically to bound memory.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut evicted: Vec<(TenantId, RequestFingerprint)> = Vec::new();
        self.entries.retain(|fp, entry| {
            let alive = entry.expires_at > now
                || (self.serve_stale_on_store_unavailable
                    && entry.expires_at.elapsed() <= self.default_ttl * 2);
            if !alive {
                evicted.push((entry.tenant.clone(), fp.clone()));
            }
            alive
        });
        for (tenant, fp) in evicted {
            if let Some(mut set) = self.by_tenant.get_mut(&tenant) {
                set.remove(&fp);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vizql_types::ColumnMeta;

    fn fp(s: &str) -> RequestFingerprint {
        RequestFingerprint(s.to_string())
    }

    fn tenant(s: &str) -> TenantId {
        TenantId(s.to_string())
    }

    fn result() -> PreviewResult {
        PreviewResult {
            columns: vec![ColumnMeta {
                name: "a".to_string(),
                dtype: vizql_types::DType::String,
            }],
            rows: vec![],
            total_estimate: Some(0),
            execution_millis: 5,
            cache_hit: false,
            truncated: false,
            stale: false,
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = PreviewCache::new(Duration::from_secs(300), false);
        let calls = AtomicUsize::new(0);
        let out = cache
            .get_or_compute(&fp("a"), &tenant("t1"), HashSet::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result())
            })
            .await
            .unwrap();
        assert!(!out.cache_hit);

        let out2 = cache
            .get_or_compute(&fp("a"), &tenant("t1"), HashSet::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result())
            })
            .await
            .unwrap();
        assert!(out2.cache_hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_flight_collapses_concurrent_misses_to_one_store_call() {
        let cache = Arc::new(PreviewCache::new(Duration::from_secs(300), false));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&fp("shared"), &tenant("t1"), HashSet::new(), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(result())
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tenant_isolation_two_tenants_never_share_an_entry() {
        let cache = PreviewCache::new(Duration::from_secs(300), false);
        cache
            .get_or_compute(
                &fp("same-fp-should-not-happen"),
                &tenant("a"),
                HashSet::new(),
                || async { Ok(result()) },
            )
            .await
            .unwrap();

        // Even if two tenants somehow produced the same fingerprint
        // string (a caller bug upstream), invalidating one tenant must
        // never evict the other's entries recorded under a different key.
        cache.invalidate_tenant(&tenant("b"));
        assert_eq!(cache.len(), 1);
        cache.invalidate_tenant(&tenant("a"));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn table_invalidation_evicts_only_matching_entries() {
        let cache = PreviewCache::new(Duration::from_secs(300), false);
        let mut trades_tables = HashSet::new();
        trades_tables.insert("trades".to_string());
        let mut other_tables = HashSet::new();
        other_tables.insert("orders".to_string());

        cache
            .get_or_compute(&fp("trades-q"), &tenant("t"), trades_tables, || async {
                Ok(result())
            })
            .await
            .unwrap();
        cache
            .get_or_compute(&fp("orders-q"), &tenant("t"), other_tables, || async {
                Ok(result())
            })
            .await
            .unwrap();

        let mut mutated = HashSet::new();
        mutated.insert("trades".to_string());
        cache.invalidate_tables(&mutated);

        assert_eq!(cache.len(), 1);
        let remaining = cache.fresh_hit(&fp("orders-q"));
        assert!(remaining.is_some());
    }

    #[tokio::test]
    async fn ttl_expiry_forces_recompute() {
        let cache = PreviewCache::new(Duration::from_millis(10), false);
        let calls = AtomicUsize::new(0);
        cache
            .get_or_compute(&fp("a"), &tenant("t"), HashSet::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result())
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache
            .get_or_compute(&fp("a"), &tenant("t"), HashSet::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_serving_only_when_policy_enabled_and_within_bound() {
        let cache = PreviewCache::new(Duration::from_millis(10), true);
        cache
            .get_or_compute(&fp("a"), &tenant("t"), HashSet::new(), || async { Ok(result()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let out = cache
            .get_or_compute(&fp("a"), &tenant("t"), HashSet::new(), || async {
                Err(CoreError::Store(StoreError::StoreUnavailable(
                    "olap".to_string(),
                )))
            })
            .await
            .unwrap();
        assert!(out.stale);
        assert!(!out.cache_hit);
    }
}
