//! Request-layer glue: compile → cache lookup → on miss, execute → store
//! in cache → return typed rows. This is the one place all five
//! components meet; every other crate stays decoupled from the others.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use vizql_core::topological_order_subset;
use vizql_gateway::service::{PreviewService, WidgetDataService};
use vizql_router::executor::{dispatch, CancelSignal, StoreClients};
use vizql_sql::{compile, AllowedIdentifierSet, CompileError, CompileOutcome, CompileRequest};
use vizql_types::errors::CoreError;
use vizql_types::fingerprint::{self, FingerprintInput};
use vizql_types::{
    ColumnMeta, CompiledSegment, DrillFilter, Graph, NodeId, Pagination, PreviewResult, RawGraph,
    RequestProfile, TenantId,
};

use crate::acl::AclProvider;
use crate::state::AppState;

/// `vizql-gateway`'s web-framework-agnostic trait boundary, implemented
/// here so `routes.rs` mounts it without reimplementing the
/// compile/cache/dispatch pipeline as free functions of its own.
#[async_trait::async_trait]
impl PreviewService for AppState {
    async fn preview(
        &self,
        tenant: TenantId,
        graph: RawGraph,
        target_node: NodeId,
        pagination: Pagination,
        drill_filters: Vec<DrillFilter>,
    ) -> Result<PreviewResult, CoreError> {
        run_preview(
            self,
            PreviewRequest {
                tenant,
                raw_graph: graph,
                target_node,
                pagination,
                drill_filters,
                profile: RequestProfile::Preview,
            },
        )
        .await
    }
}

#[async_trait::async_trait]
impl WidgetDataService for AppState {
    async fn widget_data(
        &self,
        tenant: TenantId,
        widget_id: String,
        pagination: Pagination,
        drill_filters: Vec<DrillFilter>,
    ) -> Result<PreviewResult, CoreError> {
        let definition = self
            .widgets
            .resolve(&tenant, &widget_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("widget {widget_id} not found")))?;
        run_preview(
            self,
            PreviewRequest {
                tenant,
                raw_graph: definition.graph,
                target_node: definition.target_node,
                pagination,
                drill_filters,
                profile: RequestProfile::Widget,
            },
        )
        .await
    }
}

fn compile_error_to_core(e: CompileError) -> CoreError {
    match e {
        CompileError::Validation(v) => CoreError::Validation(v),
        CompileError::TenantAcl(t) => CoreError::TenantAcl(t),
    }
}

/// Resolves a `data_source` node's `config.table` against the catalog and
/// injects the resulting columns into `config.columns` before schema
/// propagation runs; the schema engine and compiler both assume this
/// already happened (see `vizql-sql::compiler::compile`, which never calls
/// a live catalog lookup of its own).
async fn hydrate_data_source_columns(
    graph: &mut Graph,
    tenant: &TenantId,
    catalog: &vizql_core::Catalog,
) {
    for node in graph.nodes.iter_mut() {
        if node.kind != vizql_types::NodeKind::DataSource {
            continue;
        }
        if node.config.get("columns").is_some() {
            continue;
        }
        let Some(table) = node.config.get("table").and_then(|v| v.as_str()).map(str::to_string)
        else {
            continue;
        };
        if let Some(schema) = catalog.lookup_table(tenant, &table).await {
            if let serde_json::Value::Object(ref mut map) = node.config {
                map.insert(
                    "columns".to_string(),
                    serde_json::to_value(&schema.columns).unwrap_or(serde_json::Value::Null),
                );
            } else {
                node.config = serde_json::json!({ "columns": schema.columns });
            }
        }
    }
}

fn ancestor_ids(graph: &Graph, target: &NodeId) -> Vec<NodeId> {
    let mut visited = HashSet::new();
    let mut stack = vec![target.clone()];
    let mut all = vec![target.clone()];
    visited.insert(target.clone());
    while let Some(id) = stack.pop() {
        for edge in graph.inbound_edges(&id) {
            if visited.insert(edge.source.clone()) {
                all.push(edge.source.clone());
                stack.push(edge.source.clone());
            }
        }
    }
    all
}

fn tables_touched(graph: &Graph, target: &NodeId) -> HashSet<String> {
    ancestor_ids(graph, target)
        .iter()
        .filter_map(|id| graph.node(id))
        .filter(|n| n.kind == vizql_types::NodeKind::DataSource)
        .filter_map(|n| n.config.get("table").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

fn raw_rows_to_preview(
    raw: vizql_router::client::RawRows,
    segment: &CompiledSegment,
    row_limit: u64,
    execution_millis: u64,
) -> PreviewResult {
    let columns: Vec<ColumnMeta> = segment
        .output_columns
        .iter()
        .map(|c| ColumnMeta {
            name: c.name.clone(),
            dtype: c.dtype,
        })
        .collect();
    let truncated = raw.rows.len() as u64 > row_limit;
    let rows = raw
        .rows
        .into_iter()
        .take(row_limit as usize)
        .map(|row| row.into_iter().collect())
        .collect();
    PreviewResult {
        columns,
        rows,
        total_estimate: raw.total_estimate,
        execution_millis,
        cache_hit: false,
        truncated,
        stale: false,
    }
}

pub struct PreviewRequest {
    pub tenant: TenantId,
    pub raw_graph: RawGraph,
    pub target_node: NodeId,
    pub pagination: Pagination,
    pub drill_filters: Vec<DrillFilter>,
    pub profile: RequestProfile,
}

pub async fn run_preview(state: &AppState, req: PreviewRequest) -> Result<PreviewResult, CoreError> {
    let mut graph = Graph::try_from_raw(req.raw_graph).map_err(|unknown| {
        let (node, type_name) = unknown
            .into_iter()
            .next()
            .expect("try_from_raw only errors with a non-empty unknown list");
        CoreError::Validation(vizql_types::errors::ValidationError::UnknownNodeType {
            node,
            type_name,
        })
    })?;

    hydrate_data_source_columns(&mut graph, &req.tenant, &state.catalog).await;

    let ancestors = ancestor_ids(&graph, &req.target_node);
    let order = topological_order_subset(&ancestors, &graph.edges)
        .map_err(|c| CoreError::Validation(vizql_types::errors::ValidationError::CycleDetected(c.0)))?;
    let ordered_configs: Vec<(&NodeId, &serde_json::Value)> = order
        .iter()
        .filter_map(|id| graph.node(id).map(|n| (id, &n.config)))
        .collect();

    let fp = fingerprint::compute(&FingerprintInput {
        tenant: &req.tenant,
        target_node: &req.target_node,
        ordered_ancestor_configs: &ordered_configs,
        pagination: req.pagination,
        drill_filters: &req.drill_filters,
    });

    let tables = tables_touched(&graph, &req.target_node);

    let cache = match req.profile {
        RequestProfile::Preview => &state.preview_cache,
        RequestProfile::Widget => &state.widget_cache,
    };

    let max_offset = state.config.pagination.max_offset;
    let allowed = state.acl.allowed_identifiers(&req.tenant).await;
    let policy = state.acl.policy().await;
    let bounds = vizql_router::bounds::ResourceBounds::for_profile(
        req.profile,
        &state.config.preview,
        &state.config.widget,
    );
    let kv_scan_limit = state.config.kv.scan_limit;
    let kv_pipeline_batch = state.config.kv.pipeline_batch;
    let store_clients = state.store_clients.clone();
    let cache_tenant = req.tenant.clone();

    cache
        .get_or_compute(&fp, &cache_tenant, tables, move || {
            let graph = graph.clone();
            let target_node = req.target_node.clone();
            let tenant = req.tenant.clone();
            let pagination = req.pagination;
            let store_clients = store_clients.clone();
            let drill_filters = req.drill_filters.clone();
            async move {
                execute_segment(
                    &graph,
                    &target_node,
                    &tenant,
                    pagination,
                    &allowed,
                    &policy,
                    max_offset,
                    &bounds,
                    kv_scan_limit,
                    kv_pipeline_batch,
                    &store_clients,
                    &drill_filters,
                )
                .await
            }
        })
        .await
}

#[allow(clippy::too_many_arguments)]
async fn execute_segment(
    graph: &Graph,
    target_node: &NodeId,
    tenant: &TenantId,
    pagination: Pagination,
    allowed: &AllowedIdentifierSet,
    policy: &vizql_sql::AclPolicy,
    max_offset: u64,
    bounds: &vizql_router::bounds::ResourceBounds,
    kv_scan_limit: u32,
    kv_pipeline_batch: u32,
    store_clients: &Arc<StoreClients>,
    drill_filters: &[DrillFilter],
) -> Result<PreviewResult, CoreError> {
    let olap_settings = Some(bounds.olap_settings());
    let compile_req = CompileRequest {
        graph,
        target_node,
        tenant,
        allowed_identifiers: allowed,
        pagination,
        acl_policy: policy,
        olap_settings,
        max_pagination_offset: max_offset,
        catalog_target_override: &|_table| None,
        drill_filters,
    };

    let outcome = compile(&compile_req).map_err(compile_error_to_core)?;
    let segment = match outcome {
        CompileOutcome::Segment(segment) => segment,
        // Empty allowed set: short-circuit to an empty result without
        // dispatching to a store.
        CompileOutcome::EmptyByAcl => {
            return Ok(PreviewResult {
                columns: vec![],
                rows: vec![],
                total_estimate: Some(0),
                execution_millis: 0,
                cache_hit: false,
                truncated: false,
                stale: false,
            });
        }
    };

    let started = Instant::now();
    // Deadline-derived cancellation: `bounds.max_execution_time` is the
    // same per-profile deadline already enforced inline for OLAP queries
    // via `SETTINGS max_execution_time`; this timer is what makes that
    // deadline bind against the stream (pgwire) and KV targets too, which
    // have no equivalent server-side query timeout of their own.
    let (cancel_tx, cancel) = CancelSignal::new_pair();
    let deadline = bounds.max_execution_time;
    let timer = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let _ = cancel_tx.send(true);
    });
    let raw = dispatch(
        &segment,
        bounds,
        kv_scan_limit,
        kv_pipeline_batch,
        store_clients.as_ref(),
        &cancel,
    )
    .await;
    timer.abort();
    let raw = raw.map_err(CoreError::from)?;
    let execution_millis = started.elapsed().as_millis() as u64;

    Ok(raw_rows_to_preview(raw, &segment, bounds.row_limit, execution_millis))
}

/// Also exposed for dashboard live-fan-out: which tables a target node's
/// ancestors read from, so a session can declare its `WidgetSubscription`
/// after compiling once.
pub fn dependent_tables(raw_graph: &RawGraph, target_node: &NodeId) -> HashSet<String> {
    let Ok(graph) = Graph::try_from_raw(raw_graph.clone()) else {
        return HashSet::new();
    };
    tables_touched(&graph, target_node)
}
