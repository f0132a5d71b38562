//! Pub/sub bus client.
//!
//! Real backend is `redis` pub/sub. A [`BusSubscriber`] trait keeps the
//! fan-out loop testable without a live Redis instance, with a
//! retry-on-error background task driving the live connection.
//!
//! A process-wide wildcard subscription wastes CPU deserializing deltas for
//! tenants with zero local sessions, so this subscribes only to patterns
//! for tenants currently served. Channels use the tenant-scoped convention
//! `<tenantID>:<kind>:<resource>` rather than a single bus-wide channel:
//! each tenant's deltas are published under `<tenantID>:table_rows:*`, and
//! [`FanOut`](crate::fanout::FanOut) issues a `PSUBSCRIBE`/`PUNSUBSCRIBE`
//! per tenant on the first/last local session transition.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::GatewayError;

/// Channel-name "kind" segment for table-row deltas in the `<tenantID>:<kind>:<resource>`
/// convention; the pattern actually subscribed per tenant is
/// `<tenantID>:table_rows:*`.
pub const TABLE_ROWS_KIND: &str = "table_rows";

pub fn table_rows_pattern(tenant_id: &str) -> String {
    format!("{tenant_id}:{TABLE_ROWS_KIND}:*")
}

/// Wire payload published on a tenant's `table_rows` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRowsDelta {
    pub tenant_id: String,
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
}

#[async_trait]
pub trait BusSubscriber: Send + Sync {
    /// Drives the subscriber loop, forwarding every delta received on any
    /// currently-subscribed tenant pattern into `sender`. Spawned once and
    /// kept running for the process's lifetime; `subscribe_tenant` and
    /// `unsubscribe_tenant` mutate the live pattern set from other tasks.
    async fn run(&self, sender: mpsc::Sender<TableRowsDelta>);

    /// Starts delivering deltas for `tenant_id`.
    async fn subscribe_tenant(&self, tenant_id: &str);

    /// Stops delivering deltas for `tenant_id`.
    async fn unsubscribe_tenant(&self, tenant_id: &str);
}

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

pub struct RedisBusSubscriber {
    client: redis::Client,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl RedisBusSubscriber {
    pub fn connect(url: &str) -> Result<Self, GatewayError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let client = redis::Client::open(url).map_err(|e| GatewayError::BusUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            commands_tx,
            commands_rx: tokio::sync::Mutex::new(Some(commands_rx)),
        })
    }
}

enum Event {
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

#[async_trait]
impl BusSubscriber for RedisBusSubscriber {
    async fn run(&self, sender: mpsc::Sender<TableRowsDelta>) {
        let mut commands = self
            .commands_rx
            .lock()
            .await
            .take()
            .expect("RedisBusSubscriber::run must only be spawned once");
        let mut patterns: HashSet<String> = HashSet::new();

        'reconnect: loop {
            let conn = match self.client.get_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "redis bus connection failed, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    continue 'reconnect;
                }
            };
            let mut pubsub = conn.into_pubsub();
            for pattern in &patterns {
                if let Err(e) = pubsub.psubscribe(pattern.as_str()).await {
                    tracing::error!(error = %e, pattern, "redis psubscribe failed, reconnecting");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    continue 'reconnect;
                }
            }

            // Re-entered on every command: subscribing or unsubscribing a
            // pattern only needs a fresh `on_message` stream over the same
            // connection, not a full reconnect.
            loop {
                use futures_util::StreamExt;
                let event = {
                    let mut stream = pubsub.on_message();
                    tokio::select! {
                        cmd = commands.recv() => Event::Command(cmd),
                        msg = stream.next() => Event::Message(msg),
                    }
                };
                match event {
                    Event::Command(Some(Command::Subscribe(pattern))) => {
                        if patterns.insert(pattern.clone()) {
                            if let Err(e) = pubsub.psubscribe(pattern.as_str()).await {
                                tracing::error!(error = %e, pattern, "redis psubscribe failed, reconnecting");
                                continue 'reconnect;
                            }
                        }
                    }
                    Event::Command(Some(Command::Unsubscribe(pattern))) => {
                        if patterns.remove(&pattern) {
                            if let Err(e) = pubsub.punsubscribe(pattern.as_str()).await {
                                tracing::error!(error = %e, pattern, "redis punsubscribe failed");
                            }
                        }
                    }
                    Event::Command(None) => return,
                    Event::Message(Some(msg)) => {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::error!(error = %e, "redis message payload decode failed");
                                continue;
                            }
                        };
                        match serde_json::from_str::<TableRowsDelta>(&payload) {
                            Ok(delta) => {
                                if sender.send(delta).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "malformed table_rows delta, dropping");
                            }
                        }
                    }
                    Event::Message(None) => {
                        tracing::error!("redis pub/sub stream ended, reconnecting");
                        tokio::time::sleep(RETRY_INTERVAL).await;
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    async fn subscribe_tenant(&self, tenant_id: &str) {
        let _ = self
            .commands_tx
            .send(Command::Subscribe(table_rows_pattern(tenant_id)));
    }

    async fn unsubscribe_tenant(&self, tenant_id: &str) {
        let _ = self
            .commands_tx
            .send(Command::Unsubscribe(table_rows_pattern(tenant_id)));
    }
}

/// In-memory bus used by tests and by any host that hasn't wired Redis in.
/// Mirrors the real subscriber's filtering semantics (deltas only reach
/// `sender` for tenants currently subscribed) so fan-out tests can exercise
/// the overread fix without a live Redis instance.
pub mod fake {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    pub struct FakeBusSubscriber {
        receiver: tokio::sync::Mutex<broadcast::Receiver<TableRowsDelta>>,
        subscribed_tenants: Mutex<HashSet<String>>,
    }

    impl FakeBusSubscriber {
        pub fn new(receiver: broadcast::Receiver<TableRowsDelta>) -> Self {
            Self {
                receiver: tokio::sync::Mutex::new(receiver),
                subscribed_tenants: Mutex::new(HashSet::new()),
            }
        }

        /// Snapshot of the currently-subscribed tenant set, for tests that
        /// assert on fan-out's subscribe/unsubscribe behavior.
        pub fn subscribed_tenants(&self) -> HashSet<String> {
            self.subscribed_tenants.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BusSubscriber for FakeBusSubscriber {
        async fn run(&self, sender: mpsc::Sender<TableRowsDelta>) {
            let mut rx = self.receiver.lock().await;
            while let Ok(delta) = rx.recv().await {
                if !self.subscribed_tenants.lock().unwrap().contains(&delta.tenant_id) {
                    continue;
                }
                if sender.send(delta).await.is_err() {
                    return;
                }
            }
        }

        async fn subscribe_tenant(&self, tenant_id: &str) {
            self.subscribed_tenants.lock().unwrap().insert(tenant_id.to_string());
        }

        async fn unsubscribe_tenant(&self, tenant_id: &str) {
            self.subscribed_tenants.lock().unwrap().remove(tenant_id);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn delta(tenant_id: &str) -> TableRowsDelta {
            TableRowsDelta {
                tenant_id: tenant_id.to_string(),
                table: "trades".to_string(),
                columns: vec![],
                rows: vec![],
            }
        }

        #[tokio::test]
        async fn only_subscribed_tenants_reach_the_output_channel() {
            let (bus_tx, bus_rx) = broadcast::channel(16);
            let fake = FakeBusSubscriber::new(bus_rx);
            fake.subscribe_tenant("t1").await;

            let (out_tx, mut out_rx) = mpsc::channel(16);
            let run = tokio::spawn(async move {
                fake.run(out_tx).await;
            });

            bus_tx.send(delta("t2")).unwrap();
            bus_tx.send(delta("t1")).unwrap();
            drop(bus_tx);

            let received = out_rx.recv().await.unwrap();
            assert_eq!(received.tenant_id, "t1");
            assert!(out_rx.recv().await.is_none());
            run.await.unwrap();
        }
    }
}
