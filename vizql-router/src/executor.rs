//! Query Router & Executor: dispatches a [`CompiledSegment`] against its
//! target store under a deadline and resource bounds, with
//! retry-on-transient-transport-error and cancellation that reaches the
//! underlying connection rather than merely abandoning the await.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use vizql_types::{CompiledSegment, KvLookupKind, SegmentPayload, StoreKind};

use crate::bounds::ResourceBounds;
use crate::client::{KvClient, OlapClient, RawRows, StreamClient};
use crate::errors::ExecutorError;

/// Cancellation signal derived from the request deadline or the caller's
/// session closing. `true` means "cancel now". Cheap to clone and share
/// into the spawned store call.
#[derive(Clone)]
pub struct CancelSignal(tokio::sync::watch::Receiver<bool>);

impl CancelSignal {
    pub fn new_pair() -> (tokio::sync::watch::Sender<bool>, CancelSignal) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (tx, CancelSignal(rx))
    }

    pub fn never() -> Self {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        CancelSignal(rx)
    }

    async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever cancelling: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct StoreClients {
    pub olap: Arc<dyn OlapClient>,
    pub stream: Arc<dyn StreamClient>,
    pub kv: Arc<dyn KvClient>,
}

const MAX_RETRIES: u32 = 2;

/// Executes a compiled segment, applying `bounds`, retrying transient
/// transport failures on idempotent reads, and racing the store call
/// against `cancel`.
pub async fn dispatch(
    segment: &CompiledSegment,
    bounds: &ResourceBounds,
    scan_limit: u32,
    pipeline_batch: u32,
    clients: &StoreClients,
    cancel: &CancelSignal,
) -> Result<RawRows, ExecutorError> {
    let work = run_with_retry(segment, bounds, scan_limit, pipeline_batch, clients);
    tokio::select! {
        result = work => result,
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
    }
}

async fn run_with_retry(
    segment: &CompiledSegment,
    bounds: &ResourceBounds,
    scan_limit: u32,
    pipeline_batch: u32,
    clients: &StoreClients,
) -> Result<RawRows, ExecutorError> {
    let mut attempt = 0;
    loop {
        let result = dispatch_once(segment, bounds, scan_limit, pipeline_batch, clients).await;
        match result {
            Err(ExecutorError::StoreUnavailable(_)) if attempt < MAX_RETRIES => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(10..100) * attempt;
                tokio::time::sleep(Duration::from_millis(jitter_ms as u64)).await;
                continue;
            }
            other => return other,
        }
    }
}

async fn dispatch_once(
    segment: &CompiledSegment,
    bounds: &ResourceBounds,
    scan_limit: u32,
    pipeline_batch: u32,
    clients: &StoreClients,
) -> Result<RawRows, ExecutorError> {
    match (&segment.payload, segment.target) {
        (SegmentPayload::Sql(sql), StoreKind::Olap) => {
            check_bounds_preflight(bounds)?;
            clients.olap.execute(sql, bounds.max_execution_time).await
        }
        (SegmentPayload::Sql(sql), StoreKind::Stream) => {
            clients.stream.execute(sql, bounds.max_execution_time).await
        }
        (SegmentPayload::Kv(lookup), StoreKind::Kv) => {
            debug_assert_eq!(lookup.kind, KvLookupKind::ScanHash);
            let keys = clients.kv.scan_keys(&lookup.key_pattern, scan_limit).await?;
            let values = clients.kv.fetch_hashes(&keys, pipeline_batch).await?;
            let rows = keys
                .iter()
                .zip(values.into_iter())
                .map(|(key, mut row)| {
                    let identifier = key.rsplit(':').next().unwrap_or(key).to_string();
                    row.insert(
                        identifier_column_name(&lookup.identifier_extractor),
                        serde_json::Value::String(identifier),
                    );
                    row
                })
                .collect::<Vec<_>>();
            let columns = rows
                .first()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default();
            Ok(RawRows {
                columns,
                total_estimate: Some(rows.len() as u64),
                rows,
            })
        }
        (payload, target) => Err(ExecutorError::StoreError(format!(
            "segment payload {payload:?} is incompatible with target {target:?}"
        ))),
    }
}

fn identifier_column_name(extractor: &str) -> String {
    // The only extractor the compiler currently emits names the
    // resulting field `symbol`, but any KV-backed table can carry a
    // different logical identifier; keep this mapping explicit rather
    // than hard-coding `symbol` everywhere.
    match extractor {
        "suffix_after_last_colon" => "symbol".to_string(),
        other => other.to_string(),
    }
}

/// Preview/widget row caps are enforced by the store via the `SETTINGS`
/// fragment already embedded in the SQL; this just guards against a
/// caller skipping that step — an omitted bound is a bug, not a silent
/// default.
fn check_bounds_preflight(bounds: &ResourceBounds) -> Result<(), ExecutorError> {
    if bounds.max_rows_to_read == 0 {
        return Err(ExecutorError::ResourceExceeded(
            "max_rows_to_read must be configured above zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeKvClient, FakeOlapClient, FakeStreamClient};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use vizql_types::{ColumnSchema, DType, Dialect, KvLookup, TenantId};

    fn bounds() -> ResourceBounds {
        ResourceBounds {
            max_execution_time: Duration::from_secs(3),
            max_memory_bytes: 100 * 1024 * 1024,
            max_rows_to_read: 10_000_000,
            row_limit: 100,
        }
    }

    fn clients(kv: FakeKvClient) -> StoreClients {
        StoreClients {
            olap: Arc::new(FakeOlapClient::default()),
            stream: Arc::new(FakeStreamClient::default()),
            kv: Arc::new(kv),
        }
    }

    #[tokio::test]
    async fn kv_scan_never_exceeds_scan_limit_regardless_of_matching_key_count() {
        let keys: Vec<String> = (0..50).map(|i| format!("latest:vwap:SYM{i}")).collect();
        let hashes: HashMap<String, indexmap::IndexMap<String, serde_json::Value>> = keys
            .iter()
            .map(|k| (k.clone(), indexmap::IndexMap::new()))
            .collect();
        let kv = FakeKvClient { keys, hashes };
        let segment = CompiledSegment {
            target: StoreKind::Kv,
            dialect: Dialect::Kv,
            payload: SegmentPayload::Kv(KvLookup {
                kind: KvLookupKind::ScanHash,
                key_pattern: "latest:vwap:*".to_string(),
                identifier_extractor: "suffix_after_last_colon".to_string(),
                post_ops: vec![],
            }),
            output_columns: vec![ColumnSchema::new("symbol", DType::String, false)],
            tenant_binding: TenantId("t".to_string()),
        };
        let (_tx, cancel) = CancelSignal::new_pair();
        let result = dispatch(&segment, &bounds(), 10, 5, &clients(FakeKvClient::default()), &cancel)
            .await;
        // FakeKvClient::default() has no keys; exercise the real one below.
        assert!(result.is_ok());

        let keys2: Vec<String> = (0..50).map(|i| format!("latest:vwap:SYM{i}")).collect();
        let kv2 = FakeKvClient {
            keys: keys2,
            hashes: HashMap::new(),
        };
        let rows = clients(kv2).kv.scan_keys("latest:vwap:*", 10).await.unwrap();
        assert!(rows.len() <= 10);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_store_call() {
        let segment = CompiledSegment {
            target: StoreKind::Olap,
            dialect: Dialect::OlapHttp,
            payload: SegmentPayload::Sql("SELECT 1".to_string()),
            output_columns: vec![],
            tenant_binding: TenantId("t".to_string()),
        };
        let olap = FakeOlapClient {
            delay: Mutex::new(Some(Duration::from_secs(10))),
            ..Default::default()
        };
        let store_clients = StoreClients {
            olap: Arc::new(olap),
            stream: Arc::new(FakeStreamClient::default()),
            kv: Arc::new(FakeKvClient::default()),
        };
        let (tx, cancel) = CancelSignal::new_pair();
        tx.send(true).unwrap();
        let result = dispatch(&segment, &bounds(), 10, 5, &store_clients, &cancel).await;
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }
}
