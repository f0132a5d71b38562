//! Minimal trait boundary a thin host (`vizql-server`) needs to mount the
//! inbound HTTP/WebSocket surfaces, without this crate depending on any
//! particular web framework.

use async_trait::async_trait;
use vizql_types::errors::CoreError;
use vizql_types::{DrillFilter, NodeId, Pagination, PreviewResult, RawGraph, TenantId};

/// Backs `POST /preview`.
#[async_trait]
pub trait PreviewService: Send + Sync {
    async fn preview(
        &self,
        tenant: TenantId,
        graph: RawGraph,
        target_node: NodeId,
        pagination: Pagination,
        drill_filters: Vec<DrillFilter>,
    ) -> Result<PreviewResult, CoreError>;
}

/// Backs `GET /widgets/{widgetID}/data`.
#[async_trait]
pub trait WidgetDataService: Send + Sync {
    async fn widget_data(
        &self,
        tenant: TenantId,
        widget_id: String,
        pagination: Pagination,
        drill_filters: Vec<DrillFilter>,
    ) -> Result<PreviewResult, CoreError>;
}

/// Backs `WebSocket /ws/dashboard/{dashboardID}` — one implementor per
/// connection, driven by the host's socket read loop.
#[async_trait]
pub trait DashboardSession: Send + Sync {
    /// A client message arrived: `{subscribe, widget_id, tables}`,
    /// `{unsubscribe, widget_id}`, or `{pong}`.
    async fn on_client_message(&self, raw: serde_json::Value);

    /// The socket closed, clean or not; releases the session from the
    /// index and unsubscribes the bus if it was the tenant's last.
    async fn on_disconnect(&self);
}
