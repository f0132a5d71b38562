//! Widget → graph resolution. `GET /widgets/{widgetID}/data` carries no
//! graph in its request body — the workflow/widget definition lives in a
//! persistent metadata store outside this crate. This trait is the
//! boundary a real host would back with that store; `InMemoryWidgetStore`
//! is a register-and-serve stand-in for tests and local runs.

use std::collections::HashMap;
use std::sync::RwLock;

use vizql_types::{NodeId, RawGraph, TenantId};

#[derive(Debug, Clone)]
pub struct WidgetDefinition {
    pub graph: RawGraph,
    pub target_node: NodeId,
}

#[async_trait::async_trait]
pub trait WidgetStore: Send + Sync {
    async fn resolve(&self, tenant: &TenantId, widget_id: &str) -> Option<WidgetDefinition>;
}

#[derive(Default)]
pub struct InMemoryWidgetStore {
    widgets: RwLock<HashMap<(TenantId, String), WidgetDefinition>>,
}

impl InMemoryWidgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant: TenantId, widget_id: impl Into<String>, def: WidgetDefinition) {
        self.widgets
            .write()
            .unwrap()
            .insert((tenant, widget_id.into()), def);
    }
}

#[async_trait::async_trait]
impl WidgetStore for InMemoryWidgetStore {
    async fn resolve(&self, tenant: &TenantId, widget_id: &str) -> Option<WidgetDefinition> {
        self.widgets
            .read()
            .unwrap()
            .get(&(tenant.clone(), widget_id.to_string()))
            .cloned()
    }
}
