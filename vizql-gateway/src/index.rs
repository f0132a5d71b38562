//! Session index: `tenantID -> sessions`, `channel -> sessions`,
//! `session -> channels`.
//!
//! Sharded by tenant behind `DashMap` the same way `vizql-cache` shards its
//! entries, so connect/disconnect on one tenant never contends with
//! another's.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use vizql_types::TenantId;

use crate::errors::GatewayError;
use crate::session::{OutboundMessage, Session, SessionId};

pub struct SessionIndex {
    by_tenant: DashMap<TenantId, HashSet<SessionId>>,
    by_channel: DashMap<String, HashSet<SessionId>>,
    by_session: DashMap<SessionId, HashSet<String>>,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIndex {
    pub fn new() -> Self {
        Self {
            by_tenant: DashMap::new(),
            by_channel: DashMap::new(),
            by_session: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Registers a newly connected session. Symmetric with
    /// [`Self::disconnect`]: every map touched here gets cleared there too.
    ///
    /// Returns `true` when this was the session's tenant's first local
    /// session — the caller should subscribe the tenant's bus pattern,
    /// symmetric with [`Self::disconnect`]'s `was_last_for_tenant`.
    pub fn connect(&self, session: Session) -> (Arc<Session>, bool) {
        let session = Arc::new(session);
        let is_first_for_tenant = {
            let mut tenant_sessions = self.by_tenant.entry(session.tenant.clone()).or_default();
            let was_empty = tenant_sessions.is_empty();
            tenant_sessions.insert(session.id.clone());
            was_empty
        };
        self.by_session.insert(session.id.clone(), HashSet::new());
        self.sessions.insert(session.id.clone(), session.clone());
        metrics::increment_gauge!("vizql_gateway_active_sessions", 1.0);
        (session, is_first_for_tenant)
    }

    /// Returns `true` when this was the session's tenant's last local
    /// session — the caller should unsubscribe the tenant's bus patterns.
    pub fn disconnect(&self, session_id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        let channels = self
            .by_session
            .remove(session_id)
            .map(|(_, c)| c)
            .unwrap_or_default();
        for channel in &channels {
            if let Some(mut set) = self.by_channel.get_mut(channel) {
                set.remove(session_id);
            }
        }

        let was_last_for_tenant = self
            .by_tenant
            .get_mut(&session.tenant)
            .map(|mut set| {
                set.remove(session_id);
                set.is_empty()
            })
            .unwrap_or(false);
        if was_last_for_tenant {
            self.by_tenant.remove(&session.tenant);
        }

        metrics::decrement_gauge!("vizql_gateway_active_sessions", 1.0);
        was_last_for_tenant
    }

    pub fn subscribe(&self, session_id: &SessionId, channel: impl Into<String>) {
        let channel = channel.into();
        self.by_channel
            .entry(channel.clone())
            .or_default()
            .insert(session_id.clone());
        if let Some(mut channels) = self.by_session.get_mut(session_id) {
            channels.insert(channel);
        }
    }

    pub fn sessions_for_tenant(&self, tenant: &TenantId) -> Vec<Arc<Session>> {
        self.by_tenant
            .get(tenant)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sessions.get(id).map(|s| s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tenant_has_local_sessions(&self, tenant: &TenantId) -> bool {
        self.by_tenant
            .get(tenant)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Pushes one message per matching widget to every local session for
    /// `tenant` whose subscribed widgets depend on `table` — `build` turns
    /// a matched widget id into the wire message. Sessions whose outbound
    /// queue has overflowed are disconnected rather than allowed to grow
    /// unboundedly.
    pub fn fan_out_table_delta(
        &self,
        tenant: &TenantId,
        table: &str,
        build: impl Fn(&str) -> OutboundMessage,
    ) {
        let mut overflowed = Vec::new();
        for session in self.sessions_for_tenant(tenant) {
            let matched_widgets = session.widgets_depending_on(table);
            if matched_widgets.is_empty() {
                continue;
            }
            for widget_id in matched_widgets {
                if !session.try_push(build(&widget_id)) {
                    let err = GatewayError::Backpressure(session.id.to_string());
                    tracing::warn!(error = %err, "dropping session");
                    overflowed.push(session.id.clone());
                    break;
                }
            }
        }
        for id in overflowed {
            self.disconnect(&id);
        }
    }

    /// Pings every live session and disconnects (unclean) any that have
    /// now missed `crate::heartbeat::MISSED_INTERVALS_BEFORE_UNCLEAN_TERMINATION`
    /// consecutive heartbeats.
    ///
    /// Returns `(tenant, was_last_for_tenant)` for each terminated session
    /// so the caller can unsubscribe the tenant's bus pattern when it was
    /// the last local session.
    pub fn heartbeat_sweep(&self) -> Vec<(TenantId, bool)> {
        let unclean: Vec<(SessionId, TenantId)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value();
                session
                    .send_heartbeat_and_check_unclean(
                        crate::heartbeat::MISSED_INTERVALS_BEFORE_UNCLEAN_TERMINATION,
                    )
                    .then(|| (session.id.clone(), session.tenant.clone()))
            })
            .collect();
        unclean
            .into_iter()
            .map(|(id, tenant)| {
                tracing::warn!(session = %id, "heartbeat missed twice, terminating session as unclean");
                let was_last_for_tenant = self.disconnect(&id);
                (tenant, was_last_for_tenant)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as HSet;
    use vizql_types::{Roles, UserId};

    fn tenant(s: &str) -> TenantId {
        TenantId(s.to_string())
    }

    fn new_session(t: &str) -> (Session, tokio::sync::mpsc::Receiver<OutboundMessage>) {
        Session::new(tenant(t), UserId("u".to_string()), Roles(vec![]))
    }

    #[test]
    fn connect_disconnect_is_symmetric_across_all_three_maps() {
        let index = SessionIndex::new();
        let (session, _rx) = new_session("t1");
        let id = session.id.clone();
        let (session, is_first) = index.connect(session);
        assert!(is_first);
        index.subscribe(&id, "t1:dashboard:d1");
        assert_eq!(index.active_count(), 1);
        assert!(index.tenant_has_local_sessions(&tenant("t1")));
        drop(session);

        let was_last = index.disconnect(&id);
        assert!(was_last);
        assert_eq!(index.active_count(), 0);
        assert!(!index.tenant_has_local_sessions(&tenant("t1")));
        assert!(index.by_channel.get("t1:dashboard:d1").is_none());
    }

    #[test]
    fn last_session_for_tenant_is_reported_only_once() {
        let index = SessionIndex::new();
        let (s1, _r1) = new_session("t1");
        let (s2, _r2) = new_session("t1");
        let id1 = s1.id.clone();
        let id2 = s2.id.clone();
        let (_, first1) = index.connect(s1);
        let (_, first2) = index.connect(s2);
        assert!(first1);
        assert!(!first2);

        assert!(!index.disconnect(&id1));
        assert!(index.disconnect(&id2));
    }

    #[test]
    fn fan_out_only_reaches_sessions_with_a_matching_widget() {
        let index = SessionIndex::new();
        let (session, mut rx) = new_session("t1");
        let mut tables = HSet::new();
        tables.insert("trades".to_string());
        session.subscribe_widget("w1", tables);
        index.connect(session);

        let (other, mut other_rx) = new_session("t1");
        let mut other_tables = HSet::new();
        other_tables.insert("orders".to_string());
        other.subscribe_widget("w2", other_tables);
        index.connect(other);

        index.fan_out_table_delta(&tenant("t1"), "trades", |widget_id| {
            OutboundMessage::TableDelta {
                widget_id: widget_id.to_string(),
                table: "trades".to_string(),
                columns: vec![],
                rows: vec![],
            }
        });

        assert!(rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn heartbeat_sweep_terminates_after_two_consecutive_misses() {
        let index = SessionIndex::new();
        let (session, _rx) = new_session("t1");
        let id = session.id.clone();
        index.connect(session);

        index.heartbeat_sweep();
        assert_eq!(index.active_count(), 1);
        index.heartbeat_sweep();
        assert_eq!(index.active_count(), 0);
        assert!(index.sessions.get(&id).is_none());
    }
}
