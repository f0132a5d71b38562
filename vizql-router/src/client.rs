//! Per-target store clients: a trait per backing store plus an in-memory
//! fake, so the router's bound/timeout/cancellation logic is testable
//! without live stores.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::errors::ExecutorError;

#[derive(Debug, Clone, PartialEq)]
pub struct RawRows {
    pub columns: Vec<String>,
    pub rows: Vec<IndexMap<String, JsonValue>>,
    pub total_estimate: Option<u64>,
}

/// `olap` target: HTTP JSON POST, the `SETTINGS` fragment already baked
/// into `sql` by the caller.
#[async_trait]
pub trait OlapClient: Send + Sync {
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RawRows, ExecutorError>;
    async fn ping(&self) -> bool;
}

/// `stream` target: PostgreSQL wire protocol, parameterized statement,
/// per-connection `statement_timeout`.
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RawRows, ExecutorError>;
    async fn ping(&self) -> bool;
}

/// `kv` target: bounded pattern scan, pipelined hash fetch.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Returns at most `scan_limit` matching keys for `pattern`.
    async fn scan_keys(&self, pattern: &str, scan_limit: u32) -> Result<Vec<String>, ExecutorError>;
    /// Pipelined hash fetch for a batch of keys, `pipeline_batch` at a time.
    async fn fetch_hashes(
        &self,
        keys: &[String],
        pipeline_batch: u32,
    ) -> Result<Vec<IndexMap<String, JsonValue>>, ExecutorError>;
    async fn ping(&self) -> bool;
}

/// Real HTTP OLAP client (ClickHouse-style `POST <url>?query=` JSON rows).
pub struct HttpOlapClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpOlapClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl OlapClient for HttpOlapClient {
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RawRows, ExecutorError> {
        let resp = self
            .http
            .post(format!("{}/?default_format=JSON", self.base_url))
            .body(sql.to_string())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::Timeout(timeout)
                } else if e.is_connect() {
                    ExecutorError::StoreUnavailable("olap".to_string())
                } else {
                    ExecutorError::StoreError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ExecutorError::StoreError(format!("{status}: {body}")));
        }

        let body: JsonValue = resp
            .json()
            .await
            .map_err(|e| ExecutorError::StoreError(e.to_string()))?;
        parse_olap_json(body)
    }

    async fn ping(&self) -> bool {
        self.http
            .get(format!("{}/ping", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

fn parse_olap_json(body: JsonValue) -> Result<RawRows, ExecutorError> {
    let meta = body
        .get("meta")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let columns: Vec<String> = meta
        .iter()
        .filter_map(|c| c.get("name").and_then(JsonValue::as_str))
        .map(str::to_owned)
        .collect();
    let data = body
        .get("data")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let rows: Vec<IndexMap<String, JsonValue>> = data
        .into_iter()
        .filter_map(|row| row.as_object().cloned())
        .map(|obj| obj.into_iter().collect())
        .collect();
    let total_estimate = body
        .get("rows_before_limit_at_least")
        .and_then(JsonValue::as_u64);
    Ok(RawRows {
        columns,
        rows,
        total_estimate,
    })
}

/// Real stream-store client over the PostgreSQL wire protocol.
pub struct PgStreamClient {
    conn_str: String,
}

impl PgStreamClient {
    pub fn new(conn_str: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
        }
    }
}

#[async_trait]
impl StreamClient for PgStreamClient {
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RawRows, ExecutorError> {
        let (client, connection) = tokio_postgres::connect(&self.conn_str, tokio_postgres::NoTls)
            .await
            .map_err(|_| ExecutorError::StoreUnavailable("stream".to_string()))?;

        let conn_handle = tokio::spawn(async move {
            let _ = connection.await;
        });

        // `statement_timeout` set per connection.
        let timeout_ms = timeout.as_millis();
        let set_timeout = client
            .batch_execute(&format!("SET statement_timeout = {timeout_ms}"));
        if tokio::time::timeout(Duration::from_secs(2), set_timeout)
            .await
            .is_err()
        {
            conn_handle.abort();
            return Err(ExecutorError::Timeout(Duration::from_secs(2)));
        }

        let query = client.query(sql, &[]);
        let rows = match tokio::time::timeout(timeout, query).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                conn_handle.abort();
                return Err(ExecutorError::StoreError(e.to_string()));
            }
            Err(_) => {
                // Cancellation must reach the store: dropping/aborting the
                // connection task tears down the socket rather than merely
                // abandoning the await.
                conn_handle.abort();
                return Err(ExecutorError::Timeout(timeout));
            }
        };

        let columns: Vec<String> = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let out_rows: Vec<IndexMap<String, JsonValue>> = rows
            .iter()
            .map(|row| pg_row_to_map(row, &columns))
            .collect();
        conn_handle.abort();
        Ok(RawRows {
            columns,
            rows: out_rows,
            total_estimate: None,
        })
    }

    async fn ping(&self) -> bool {
        match tokio_postgres::connect(&self.conn_str, tokio_postgres::NoTls).await {
            Ok((client, connection)) => {
                tokio::spawn(async move {
                    let _ = connection.await;
                });
                client.simple_query("SELECT 1").await.is_ok()
            }
            Err(_) => false,
        }
    }
}

fn pg_row_to_map(row: &tokio_postgres::Row, columns: &[String]) -> IndexMap<String, JsonValue> {
    let mut map = IndexMap::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let value: JsonValue = row
            .try_get::<_, Option<String>>(idx)
            .map(|v| v.map(JsonValue::String).unwrap_or(JsonValue::Null))
            .unwrap_or(JsonValue::Null);
        map.insert(name.clone(), value);
    }
    map
}

/// Real KV client: Redis `SCAN MATCH`/`HGETALL`, with pipelined `HGETALL`
/// batching, using the same async runtime `vizql-gateway`'s bus client
/// already uses.
pub struct RedisKvClient {
    client: redis::Client,
}

impl RedisKvClient {
    pub fn connect(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl KvClient for RedisKvClient {
    async fn scan_keys(&self, pattern: &str, scan_limit: u32) -> Result<Vec<String>, ExecutorError> {
        use redis::AsyncCommands;

        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| ExecutorError::StoreUnavailable(format!("kv: {e}")))?;
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| ExecutorError::StoreError(e.to_string()))?;

        let mut keys = Vec::new();
        while keys.len() < scan_limit as usize {
            match iter.next_item().await {
                Some(key) => keys.push(key),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn fetch_hashes(
        &self,
        keys: &[String],
        pipeline_batch: u32,
    ) -> Result<Vec<IndexMap<String, JsonValue>>, ExecutorError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| ExecutorError::StoreUnavailable(format!("kv: {e}")))?;

        let batch_size = pipeline_batch.max(1) as usize;
        let mut out = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(batch_size) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.hgetall(key);
            }
            let results: Vec<std::collections::HashMap<String, String>> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| ExecutorError::StoreError(e.to_string()))?;
            for hash in results {
                let row: IndexMap<String, JsonValue> = hash
                    .into_iter()
                    .map(|(k, v)| (k, JsonValue::String(v)))
                    .collect();
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn ping(&self) -> bool {
        match self.client.get_async_connection().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }
}

/// In-memory fakes used by router tests (no live stores required).
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeOlapClient {
        pub fixed_response: Mutex<Option<RawRows>>,
        pub delay: Mutex<Option<Duration>>,
    }

    #[async_trait]
    impl OlapClient for FakeOlapClient {
        async fn execute(&self, _sql: &str, timeout: Duration) -> Result<RawRows, ExecutorError> {
            if let Some(delay) = *self.delay.lock().unwrap() {
                if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                    .await
                    .is_err()
                {
                    return Err(ExecutorError::Timeout(timeout));
                }
            }
            Ok(self
                .fixed_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(RawRows {
                    columns: vec![],
                    rows: vec![],
                    total_estimate: Some(0),
                }))
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    pub struct FakeStreamClient {
        pub fixed_response: Mutex<Option<RawRows>>,
    }

    #[async_trait]
    impl StreamClient for FakeStreamClient {
        async fn execute(&self, _sql: &str, _timeout: Duration) -> Result<RawRows, ExecutorError> {
            Ok(self
                .fixed_response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(RawRows {
                    columns: vec![],
                    rows: vec![],
                    total_estimate: Some(0),
                }))
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    pub struct FakeKvClient {
        pub keys: Vec<String>,
        pub hashes: std::collections::HashMap<String, IndexMap<String, JsonValue>>,
    }

    #[async_trait]
    impl KvClient for FakeKvClient {
        async fn scan_keys(&self, pattern: &str, scan_limit: u32) -> Result<Vec<String>, ExecutorError> {
            let prefix = pattern.trim_end_matches('*');
            Ok(self
                .keys
                .iter()
                .filter(|k| k.starts_with(prefix))
                .take(scan_limit as usize)
                .cloned()
                .collect())
        }

        async fn fetch_hashes(
            &self,
            keys: &[String],
            _pipeline_batch: u32,
        ) -> Result<Vec<IndexMap<String, JsonValue>>, ExecutorError> {
            Ok(keys
                .iter()
                .filter_map(|k| self.hashes.get(k).cloned())
                .collect())
        }

        async fn ping(&self) -> bool {
            true
        }
    }
}
