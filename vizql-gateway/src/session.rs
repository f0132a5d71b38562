//! Per-connection WebSocket session state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use vizql_types::{Roles, TenantId, UserId};

pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message pushed to a live dashboard session. Serialized to JSON on the
/// WebSocket wire by the host (`vizql-server`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    TableDelta {
        widget_id: String,
        table: String,
        columns: Vec<String>,
        rows: Vec<serde_json::Value>,
    },
    Heartbeat,
}

/// One widget a session is actively viewing, with the table names its
/// compiled query depends on, so a delta's effect on the widget can be
/// judged by table name match at minimum.
#[derive(Debug, Clone)]
pub struct WidgetSubscription {
    pub widget_id: String,
    pub tables: HashSet<String>,
}

/// A single connected dashboard session, held behind `Arc` by the session
/// index so fan-out can read it concurrently with the owning connection
/// task mutating its widget set — the mutable parts are therefore behind
/// interior mutability rather than `&mut self` (the `parking_lot`
/// discipline `vizql-core::catalog` and `vizql-cache` already use).
pub struct Session {
    pub id: SessionId,
    pub tenant: TenantId,
    pub user: UserId,
    pub roles: Roles,
    sender: mpsc::Sender<OutboundMessage>,
    widgets: Mutex<HashMap<String, WidgetSubscription>>,
    missed_heartbeats: AtomicU32,
}

impl Session {
    pub fn new(
        tenant: TenantId,
        user: UserId,
        roles: Roles,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (
            Session {
                id: SessionId::new(),
                tenant,
                user,
                roles,
                sender: tx,
                widgets: Mutex::new(HashMap::new()),
                missed_heartbeats: AtomicU32::new(0),
            },
            rx,
        )
    }

    pub fn subscribe_widget(&self, widget_id: impl Into<String>, tables: HashSet<String>) {
        let widget_id = widget_id.into();
        self.widgets
            .lock()
            .insert(widget_id.clone(), WidgetSubscription { widget_id, tables });
    }

    pub fn unsubscribe_widget(&self, widget_id: &str) {
        self.widgets.lock().remove(widget_id);
    }

    /// Widget ids whose declared tables include `table`.
    pub fn widgets_depending_on(&self, table: &str) -> Vec<String> {
        self.widgets
            .lock()
            .values()
            .filter(|w| w.tables.contains(table))
            .map(|w| w.widget_id.clone())
            .collect()
    }

    /// Attempts to push `message`; returns `false` (caller should drop the
    /// session) on a full queue rather than blocking or buffering further.
    pub fn try_push(&self, message: OutboundMessage) -> bool {
        self.sender.try_send(message).is_ok()
    }

    /// Sends a heartbeat ping and bumps the miss counter; the host's read
    /// loop calls [`Self::record_pong`] when a pong arrives, resetting it.
    /// Returns `true` when the session has now missed
    /// [`crate::heartbeat::MISSED_INTERVALS_BEFORE_UNCLEAN_TERMINATION`]
    /// consecutive pings and must be terminated as unclean.
    pub fn send_heartbeat_and_check_unclean(&self, missed_threshold: u32) -> bool {
        let missed = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.try_push(OutboundMessage::Heartbeat);
        missed >= missed_threshold
    }

    pub fn record_pong(&self) {
        self.missed_heartbeats.store(0, Ordering::SeqCst);
    }
}
