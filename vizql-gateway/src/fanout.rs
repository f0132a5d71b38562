//! Wires the pub/sub bus to the session index and the preview cache.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use vizql_cache::PreviewCache;
use vizql_types::TenantId;

use crate::bus::{BusSubscriber, TableRowsDelta};
use crate::index::SessionIndex;
use crate::session::{OutboundMessage, Session, SessionId};

pub struct FanOut {
    index: Arc<SessionIndex>,
    cache: Arc<PreviewCache>,
    subscriber: Arc<dyn BusSubscriber>,
}

impl FanOut {
    pub fn new(index: Arc<SessionIndex>, cache: Arc<PreviewCache>, subscriber: Arc<dyn BusSubscriber>) -> Self {
        Self { index, cache, subscriber }
    }

    /// Drives the subscriber loop for the process's lifetime. Unlike a
    /// single static-channel subscription, which would deserialize deltas
    /// for every tenant regardless of whether this process serves them,
    /// the actual pattern set is empty until [`Self::connect`] adds a
    /// tenant on its first local session.
    pub async fn run(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<TableRowsDelta>(1024);
        let subscriber = self.subscriber.clone();
        tokio::spawn(async move {
            subscriber.run(tx).await;
        });

        while let Some(delta) = rx.recv().await {
            self.handle_delta(delta);
        }
    }

    /// Registers `session` in the session index and, if this is its
    /// tenant's first local session, subscribes the tenant's bus pattern.
    pub async fn connect(&self, session: Session) -> Arc<Session> {
        let (session, is_first_for_tenant) = self.index.connect(session);
        if is_first_for_tenant {
            self.subscriber.subscribe_tenant(&session.tenant.0).await;
        }
        session
    }

    /// Removes `session_id` from the session index and, if it was its
    /// tenant's last local session, unsubscribes the tenant's bus pattern.
    pub async fn disconnect(&self, session_id: &SessionId, tenant: &TenantId) {
        let was_last_for_tenant = self.index.disconnect(session_id);
        if was_last_for_tenant {
            self.subscriber.unsubscribe_tenant(&tenant.0).await;
        }
    }

    fn handle_delta(&self, delta: TableRowsDelta) {
        let tenant = TenantId(delta.tenant_id.clone());

        // Cache invalidation is global per fingerprint's declared tables,
        // independent of session presence — a tenant with zero local
        // sessions on this process may still have its cached previews
        // served by another process.
        let mut mutated = HashSet::new();
        mutated.insert(delta.table.clone());
        self.cache.invalidate_tables(&mutated);

        if !self.index.tenant_has_local_sessions(&tenant) {
            return;
        }

        self.index
            .fan_out_table_delta(&tenant, &delta.table, |widget_id| OutboundMessage::TableDelta {
                widget_id: widget_id.to_string(),
                table: delta.table.clone(),
                columns: delta.columns.clone(),
                rows: delta.rows.clone(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBusSubscriber;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use vizql_types::{Roles, UserId};

    fn fan_out() -> (Arc<FanOut>, Arc<FakeBusSubscriber>) {
        let (_bus_tx, bus_rx) = broadcast::channel(16);
        let subscriber = Arc::new(FakeBusSubscriber::new(bus_rx));
        let index = Arc::new(SessionIndex::new());
        let cache = Arc::new(PreviewCache::new(Duration::from_secs(60), false));
        let fan_out = Arc::new(FanOut::new(index, cache, subscriber.clone()));
        (fan_out, subscriber)
    }

    fn session(tenant: &str) -> Session {
        let (session, _rx) = Session::new(TenantId(tenant.to_string()), UserId("u".to_string()), Roles(vec![]));
        session
    }

    #[tokio::test]
    async fn first_session_subscribes_and_last_disconnect_unsubscribes() {
        let (fan_out, subscriber) = fan_out();

        let s1 = fan_out.connect(session("t1")).await;
        let s2 = fan_out.connect(session("t1")).await;
        assert_eq!(
            subscriber.subscribed_tenants().len(),
            1,
            "a second session for the same tenant must not re-subscribe"
        );

        fan_out.disconnect(&s1.id, &s1.tenant).await;
        assert!(
            subscriber.subscribed_tenants().contains("t1"),
            "tenant must stay subscribed while it still has a local session"
        );

        fan_out.disconnect(&s2.id, &s2.tenant).await;
        assert!(
            !subscriber.subscribed_tenants().contains("t1"),
            "last session for the tenant must unsubscribe"
        );
    }
}
