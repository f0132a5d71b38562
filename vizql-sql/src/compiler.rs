//! Workflow compiler: turns a [`Graph`] plus a target node into a
//! [`CompiledSegment`] — the ordered phases are ancestor isolation,
//! topological sort (the same routine the schema engine uses), target
//! detection, per-node AST construction, adjacent-chain merging, tenant
//! ACL injection, pagination, and (for `kv` targets) the key-scan payload.
//!
//! This module never builds SQL by string-formatting a caller-controlled
//! value; every literal that reaches the AST goes through
//! [`crate::ast::Literal::typed`] or [`crate::formula::compile`].

use std::collections::{HashMap, HashSet};

use serde_json::Value as JsonValue;
use vizql_core::{propagate_schemas, topological_order_subset, SchemaMap};
use vizql_types::errors::{TenantAclError, ValidationError};
use vizql_types::filterop::is_recognized_operator;
use vizql_types::{
    ColumnSchema, CompiledSegment, DType, DrillFilter, Edge, Graph, KvLookup, KvLookupKind, Node,
    NodeId, NodeKind, Pagination, PostFetchOp, SegmentPayload, StoreKind, TenantId,
};

use crate::ast::{
    BinOp, Dialect, Expr, FromClause, JoinClause, JoinType, Literal, OlapSettings, OrderByItem,
    PaginatedQuery, SelectStmt, SetOp, SetOpStmt,
};
use crate::errors::{validate_identifier, CompileError};
use crate::formula;

/// How a data source's backing table is isolated per tenant. Declared
/// explicitly per table name — there is no implicit "no ACL needed"
/// default, because an omitted entry is exactly the cross-tenant leak
/// class this compiler is built to make unreachable.
#[derive(Debug, Clone)]
pub enum AclRule {
    /// A shared serving-layer table with no tenant column: inject
    /// `<identifier_column> IN (<allowed set>)`.
    SharedIdentifier { identifier_column: String },
    /// A metadata table carrying an explicit tenant column: inject
    /// `<column> = <tenantID>`.
    TenantColumn { column: String },
    /// Table is already tenant-isolated upstream (e.g. a per-tenant
    /// physical table); no predicate is injected. Must still be declared
    /// explicitly, same as the other two variants.
    None,
}

pub type AclPolicy = HashMap<String, AclRule>;

/// The finite set of row-level identifiers a tenant may read on shared
/// tables lacking a tenant column.
#[derive(Debug, Clone, Default)]
pub struct AllowedIdentifierSet(pub HashSet<String>);

/// Inputs to one compile.
pub struct CompileRequest<'a> {
    pub graph: &'a Graph,
    pub target_node: &'a NodeId,
    pub tenant: &'a TenantId,
    pub allowed_identifiers: &'a AllowedIdentifierSet,
    pub pagination: Pagination,
    pub acl_policy: &'a AclPolicy,
    /// Resource bounds rendered into the OLAP `SETTINGS` fragment. `None`
    /// suppresses the fragment entirely, which only makes sense for
    /// non-`olap` targets.
    pub olap_settings: Option<OlapSettings>,
    pub max_pagination_offset: u64,
    /// Catalog-declared target override consulted before the table-name
    /// prefix heuristic; additive, falls back to prefix detection when
    /// absent for a table.
    pub catalog_target_override: &'a dyn Fn(&str) -> Option<StoreKind>,
    /// Request-time drill-down filters, applied as an extra `WHERE`
    /// predicate against the target's output schema for SQL segments, or
    /// as extra post-fetch filters for KV segments.
    pub drill_filters: &'a [DrillFilter],
}

/// Either a compiled segment, or the ACL short-circuit taken when the
/// allowed-identifier set is empty: the compiler short-circuits to an
/// empty result without dispatching.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Segment(CompiledSegment),
    EmptyByAcl,
}

pub fn compile(req: &CompileRequest<'_>) -> Result<CompileOutcome, CompileError> {
    let ancestor_ids = ancestors_of(req.graph, req.target_node);
    let mut node_set = ancestor_ids;
    node_set.insert(req.target_node.clone());

    let isolated = isolate(req.graph, &node_set);
    let order = topological_order_subset(
        &isolated.nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>(),
        &isolated.edges,
    )
    .map_err(|c| ValidationError::CycleDetected(c.0))?;

    let schemas = propagate_schemas(&isolated, |_table| None)?;

    let mut builder = SegmentBuilder {
        req,
        isolated: &isolated,
        schemas: &schemas,
        frags: HashMap::new(),
        detected_store: HashMap::new(),
        short_circuit: false,
    };

    for node_id in &order {
        let node = isolated
            .node(node_id)
            .expect("topological order only yields nodes present in the isolated graph");
        builder.compile_node(node)?;
        if builder.short_circuit {
            return Ok(CompileOutcome::EmptyByAcl);
        }
    }

    let target_frag = builder
        .frags
        .remove(req.target_node)
        .expect("target node is always visited last in its own topological order");
    let target_store = *builder
        .detected_store
        .get(req.target_node)
        .expect("every visited node has a detected store");

    let output_columns = schemas
        .get(req.target_node)
        .cloned()
        .unwrap_or_default();

    let segment = match target_frag {
        Frag::Sql(mut stmt, stage) => {
            for drill in req.drill_filters {
                let column = output_columns
                    .iter()
                    .find(|c| c.name == drill.column)
                    .ok_or_else(|| {
                        ValidationError::UnresolvedColumn {
                            node: req.target_node.clone(),
                            column: drill.column.clone(),
                        }
                    })?
                    .clone();
                let predicate = build_operator_expr(&column, &drill.operator, &drill.value)?;
                // Same merge-compatibility rule as `filter|group_by` ->
                // HAVING: the target node's own output may be an aggregate
                // statement, and a drill-down filter on it must land in
                // HAVING, not WHERE.
                if stage == MergeStage::Grouped {
                    stmt.having = Some(match stmt.having.take() {
                        Some(existing) => {
                            Expr::Binary(Box::new(existing), BinOp::And, Box::new(predicate))
                        }
                        None => predicate,
                    });
                } else {
                    stmt.and_where(predicate);
                }
            }

            let dialect = sql_dialect(target_store);
            let mut inner = stmt.render(dialect);
            if target_store == StoreKind::Olap {
                if let Some(settings) = req.olap_settings {
                    inner.push(' ');
                    inner.push_str(&settings.render());
                }
            }
            let offset = req.pagination.offset.min(req.max_pagination_offset);
            let paginated = PaginatedQuery {
                inner_sql: inner,
                limit: req.pagination.limit,
                offset,
            };
            CompiledSegment {
                target: target_store,
                dialect: types_dialect(target_store),
                payload: SegmentPayload::Sql(paginated.render()),
                output_columns,
                tenant_binding: req.tenant.clone(),
            }
        }
        Frag::Kv {
            key_pattern,
            identifier_extractor,
            mut post_ops,
        } => {
            for drill in req.drill_filters {
                if !is_recognized_operator(&drill.operator) {
                    return Err(ValidationError::InvalidOperator(drill.operator.clone()).into());
                }
                post_ops.push(PostFetchOp::Filter {
                    column: drill.column.clone(),
                    operator: drill.operator.clone(),
                    value: drill.value.clone(),
                });
            }
            CompiledSegment {
                target: StoreKind::Kv,
                dialect: vizql_types::Dialect::Kv,
                payload: SegmentPayload::Kv(KvLookup {
                    kind: KvLookupKind::ScanHash,
                    key_pattern,
                    identifier_extractor,
                    post_ops,
                }),
                output_columns,
                tenant_binding: req.tenant.clone(),
            }
        }
    };

    Ok(CompileOutcome::Segment(segment))
}

fn sql_dialect(store: StoreKind) -> Dialect {
    match store {
        StoreKind::Stream => Dialect::StreamPgwire,
        _ => Dialect::OlapHttp,
    }
}

fn types_dialect(store: StoreKind) -> vizql_types::Dialect {
    match store {
        StoreKind::Olap => vizql_types::Dialect::OlapHttp,
        StoreKind::Stream => vizql_types::Dialect::StreamPgwire,
        StoreKind::Kv => vizql_types::Dialect::Kv,
    }
}

/// Where a [`SelectStmt`] sits in the merge-compatibility chain. Only the
/// transitions named in the merge table collapse two adjacent nodes into
/// one statement; every other boundary wraps the statement-so-far in a
/// subquery and starts fresh. `Other` covers every node kind the merge
/// table never names as an upstream partner (`rename`, `limit`, `sample`,
/// `unique`, `pivot`, `formula`, `window`, `join`, `union`) — its output
/// can never be merged into by a later node, only wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeStage {
    /// Fresh from a `data_source` (ACL predicate, if any, already applied).
    Source,
    /// A `filter` merged its predicate into `WHERE`.
    Filtered,
    /// A `select` (or a subquery-wrapped `select`) set the projection.
    Projected,
    /// Output of `group_by`: `GROUP BY` set, aggregates in the projection.
    Grouped,
    Other,
}

/// Per-node compiled state kept during the walk. `Sql` carries the
/// in-progress statement for the maximal merge-compatible chain this node
/// belongs to, tagged with the [`MergeStage`] that decides whether the
/// next node may extend it in place or must wrap it in a subquery; `Kv`
/// carries the scan descriptor plus any post-fetch operations downstream
/// nodes append. Filters/sorts/limits on a KV segment are applied
/// in-process post-fetch, tracked here only for completeness — the
/// router is what executes them.
#[derive(Debug, Clone)]
enum Frag {
    Sql(SelectStmt, MergeStage),
    Kv {
        key_pattern: String,
        identifier_extractor: String,
        post_ops: Vec<PostFetchOp>,
    },
}

struct SegmentBuilder<'a> {
    req: &'a CompileRequest<'a>,
    isolated: &'a Graph,
    schemas: &'a SchemaMap,
    frags: HashMap<NodeId, Frag>,
    detected_store: HashMap<NodeId, StoreKind>,
    short_circuit: bool,
}

impl<'a> SegmentBuilder<'a> {
    fn input_schema(&self, node_id: &NodeId) -> &[ColumnSchema] {
        self.schemas
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn single_parent(&self, node: &Node) -> Option<NodeId> {
        self.isolated.inbound_edges(&node.id).next().map(|e: &Edge| e.source.clone())
    }

    fn parents(&self, node: &Node) -> Vec<NodeId> {
        self.isolated.inbound_edges(&node.id).map(|e| e.source.clone()).collect()
    }

    fn compile_node(&mut self, node: &Node) -> Result<(), CompileError> {
        match node.kind {
            NodeKind::DataSource => self.compile_data_source(node),
            NodeKind::Filter => self.compile_filter(node),
            NodeKind::Select => self.compile_select(node),
            NodeKind::Sort => self.compile_sort(node),
            NodeKind::Rename => self.compile_rename(node),
            NodeKind::Limit => self.compile_limit(node),
            NodeKind::Sample => self.compile_sample(node),
            NodeKind::Unique => self.compile_unique(node),
            NodeKind::GroupBy => self.compile_group_by(node),
            NodeKind::Pivot => self.compile_pivot(node),
            NodeKind::Formula => self.compile_formula(node),
            NodeKind::Window => self.compile_window(node),
            NodeKind::Join => self.compile_join(node),
            NodeKind::Union => self.compile_union(node),
            NodeKind::ChartOutput | NodeKind::TableOutput | NodeKind::KpiOutput => {
                self.compile_passthrough(node)
            }
        }
    }

    /// Carries the single parent's fragment and detected store forward
    /// unchanged — terminal output nodes don't touch the query: their
    /// schema transform is the empty list, so the compiler has nothing
    /// to add either.
    fn compile_passthrough(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        let frag = self.frags.get(&parent).cloned().expect("parent compiled before child");
        let store = *self.detected_store.get(&parent).expect("parent store known");
        self.frags.insert(node.id.clone(), frag);
        self.detected_store.insert(node.id.clone(), store);
        Ok(())
    }

    fn compile_data_source(&mut self, node: &Node) -> Result<(), CompileError> {
        let table = node
            .config
            .get("table")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();

        let store = (self.req.catalog_target_override)(&table).unwrap_or_else(|| detect_store(&table));
        self.detected_store.insert(node.id.clone(), store);

        if store == StoreKind::Kv {
            self.frags.insert(
                node.id.clone(),
                Frag::Kv {
                    key_pattern: table.clone(),
                    identifier_extractor: "suffix_after_last_colon".to_string(),
                    post_ops: Vec::new(),
                },
            );
            return Ok(());
        }

        validate_identifier(&table)?;
        let mut stmt = SelectStmt::new(FromClause::Table(table.clone()));

        match self.acl_rule_for(&table)? {
            AclRule::SharedIdentifier { identifier_column } => {
                if self.req.allowed_identifiers.0.is_empty() {
                    self.short_circuit = true;
                    // Still register a frag so later nodes (already visited
                    // is impossible here since this is topological order,
                    // but keep state consistent) don't panic if referenced.
                    self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Source));
                    return Ok(());
                }
                validate_identifier(&identifier_column)?;
                let list: Vec<Expr> = self
                    .req
                    .allowed_identifiers
                    .0
                    .iter()
                    .map(|id| Expr::Literal(Literal::Str(id.clone())))
                    .collect();
                stmt.and_where(Expr::InList {
                    expr: Box::new(Expr::Column(identifier_column)),
                    list,
                    negated: false,
                });
            }
            AclRule::TenantColumn { column } => {
                validate_identifier(&column)?;
                stmt.and_where(Expr::Binary(
                    Box::new(Expr::Column(column)),
                    BinOp::Eq,
                    Box::new(Expr::Literal(Literal::Str(self.req.tenant.0.clone()))),
                ));
            }
            AclRule::None => {}
        }

        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Source));
        Ok(())
    }

    fn acl_rule_for(&self, table: &str) -> Result<AclRule, CompileError> {
        match self.req.acl_policy.get(table) {
            Some(rule) => Ok(rule.clone()),
            None => Err(CompileError::TenantAcl(TenantAclError::TenantAclMissing(
                table.to_string(),
            ))),
        }
    }

    /// Looks up a column in the node's own computed input schema, raising
    /// `UnresolvedColumn` rather than silently treating an unknown name
    /// as, say, a string literal.
    fn resolve_column<'s>(
        &self,
        node: &Node,
        input: &'s [ColumnSchema],
        name: &str,
    ) -> Result<&'s ColumnSchema, CompileError> {
        input
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                CompileError::Validation(ValidationError::UnresolvedColumn {
                    node: node.id.clone(),
                    column: name.to_string(),
                })
            })
    }

    fn take_parent_stmt(&mut self, parent: &NodeId) -> SelectStmt {
        self.take_parent_frag(parent).0
    }

    fn take_parent_frag(&mut self, parent: &NodeId) -> (SelectStmt, MergeStage) {
        match self.frags.remove(parent) {
            Some(Frag::Sql(stmt, stage)) => (stmt, stage),
            Some(Frag::Kv { .. }) => {
                // KV segments carry no SQL; downstream ops apply post-fetch.
                // We still need a placeholder so a chain that eventually
                // hits a non-KV merge doesn't panic; this path is only
                // reachable for nodes the router, not the compiler, will
                // actually execute against KV.
                (SelectStmt::new(FromClause::Table(String::new())), MergeStage::Other)
            }
            None => panic!("parent must be compiled before its child in topological order"),
        }
    }

    /// Returns the parent's statement ready to extend in place if its
    /// [`MergeStage`] is one the merge table allows the current node to
    /// continue from, otherwise wraps it in a subquery and hands back a
    /// fresh outer statement — the non-merge-compatible boundary the
    /// merge table requires.
    fn merge_or_wrap(&mut self, parent: &NodeId, allowed: &[MergeStage]) -> SelectStmt {
        let (stmt, stage) = self.take_parent_frag(parent);
        if allowed.contains(&stage) {
            stmt
        } else {
            SelectStmt::new(FromClause::Subquery(Box::new(stmt)))
        }
    }

    fn carry_store(&mut self, from: &NodeId, to: &NodeId) {
        let store = *self.detected_store.get(from).expect("parent store known");
        self.detected_store.insert(to.clone(), store);
    }

    fn compile_filter(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;

        let column_name = node
            .config
            .get("column")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let operator = node
            .config
            .get("operator")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let value = node.config.get("value").cloned().unwrap_or(JsonValue::Null);

        if self.is_kv_frag(&parent) {
            // No schema-resolved column to validate against post-fetch; the
            // recognized-operator check still applies so a typo fails the
            // compile instead of silently matching nothing at dispatch time.
            if !is_recognized_operator(operator) {
                return Err(ValidationError::InvalidOperator(operator.to_string()).into());
            }
            self.push_kv_post_op(
                &parent,
                &node.id,
                PostFetchOp::Filter {
                    column: column_name.to_string(),
                    operator: operator.to_string(),
                    value,
                },
            );
            return Ok(());
        }

        let input = self.input_schema(&parent).to_vec();
        let column = self.resolve_column(node, &input, column_name)?.clone();
        let predicate = build_operator_expr(&column, operator, &value)?;

        let (stmt, stage) = self.take_parent_frag(&parent);
        let (mut stmt, next_stage) = match stage {
            // data_source | filter -> WHERE added.
            MergeStage::Source => (stmt, MergeStage::Filtered),
            // group_by | filter -> HAVING. Nothing downstream of a HAVING
            // merge is itself merge-compatible, so the result is untagged.
            MergeStage::Grouped => {
                let mut stmt = stmt;
                stmt.having = Some(match stmt.having.take() {
                    Some(existing) => Expr::Binary(Box::new(existing), BinOp::And, Box::new(predicate)),
                    None => predicate,
                });
                self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
                self.carry_store(&parent, &node.id);
                return Ok(());
            }
            // Every other boundary (filtered-again, projected, sorted,
            // rename/limit/pivot/formula/window output, ...) isn't listed
            // as merge-compatible with `filter`: wrap it in a subquery
            // rather than ANDing a predicate into a statement whose
            // projection may reference aliases not visible to a WHERE
            // clause, or whose row order/limit the predicate would
            // otherwise silently reorder.
            _ => (SelectStmt::new(FromClause::Subquery(Box::new(stmt))), MergeStage::Filtered),
        };
        stmt.and_where(predicate);
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, next_stage));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn is_kv_frag(&self, node: &NodeId) -> bool {
        matches!(self.frags.get(node), Some(Frag::Kv { .. }))
    }

    /// Carries the parent KV fragment forward with one more [`PostFetchOp`]
    /// appended, preserving the visitation order the router applies them
    /// in (filter → sort → limit).
    fn push_kv_post_op(&mut self, parent: &NodeId, child: &NodeId, op: PostFetchOp) {
        self.push_kv_post_ops(parent, child, vec![op]);
    }

    fn push_kv_post_ops(&mut self, parent: &NodeId, child: &NodeId, ops: Vec<PostFetchOp>) {
        let Some(Frag::Kv { key_pattern, identifier_extractor, mut post_ops }) =
            self.frags.get(parent).cloned()
        else {
            panic!("push_kv_post_ops called on a non-KV parent fragment");
        };
        post_ops.extend(ops);
        self.frags.insert(
            child.clone(),
            Frag::Kv { key_pattern, identifier_extractor, post_ops },
        );
        self.carry_store(parent, child);
    }

    fn compile_select(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }

        // Project exactly what the schema engine computed for this node —
        // guarantees SQL and schema stay in lockstep for every projecting
        // node. Merge-compatible only coming off a `filter` (merge table
        // "filter | select"); any other incoming stage (bare data_source,
        // another select, a group_by/pivot/formula/window whose projection
        // already carries aggregates or aliased expressions this select
        // would otherwise clobber) gets a subquery boundary instead.
        let output = self.schemas.get(&node.id).cloned().unwrap_or_default();
        let mut stmt = self.merge_or_wrap(&parent, &[MergeStage::Filtered]);
        stmt.projection = output
            .iter()
            .map(|c| (Expr::Column(c.name.clone()), None))
            .collect();
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Projected));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_sort(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;

        #[derive(serde::Deserialize)]
        struct SortKey {
            column: String,
            #[serde(default = "default_true")]
            ascending: bool,
        }
        fn default_true() -> bool {
            true
        }

        let keys: Vec<SortKey> = node
            .config
            .get("keys")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if self.is_kv_frag(&parent) {
            // KV rows have no declared schema to validate sort keys against;
            // each key becomes its own post-fetch sort, applied in the order
            // given (stable sort, so the first key wins ties on later ones).
            self.push_kv_post_ops(
                &parent,
                &node.id,
                keys.iter()
                    .map(|key| PostFetchOp::Sort { column: key.column.clone(), ascending: key.ascending })
                    .collect(),
            );
            return Ok(());
        }

        let input = self.input_schema(&parent).to_vec();
        let mut order_by = Vec::with_capacity(keys.len());
        for key in &keys {
            self.resolve_column(node, &input, &key.column)?;
            order_by.push(OrderByItem {
                expr: Expr::Column(key.column.clone()),
                ascending: key.ascending,
            });
        }

        // Merge table: "select | sort". Anything else wraps.
        let mut stmt = self.merge_or_wrap(&parent, &[MergeStage::Projected]);
        stmt.order_by = order_by;
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_rename(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let rename_map: HashMap<String, String> = node
            .config
            .get("rename_map")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let input = self.input_schema(&parent).to_vec();

        // `rename` never appears in the merge table, so it always opens a
        // new subquery boundary rather than reusing the parent statement in
        // place.
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        stmt.projection = input
            .iter()
            .map(|c| {
                let alias = rename_map.get(&c.name).cloned();
                (Expr::Column(c.name.clone()), alias)
            })
            .collect();
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_limit(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        let n = node.config.get("n").and_then(JsonValue::as_u64).unwrap_or(u64::MAX);
        if self.is_kv_frag(&parent) {
            self.push_kv_post_op(&parent, &node.id, PostFetchOp::Limit(n));
            return Ok(());
        }
        // Not in the merge table: a downstream `filter` must never land in
        // the same statement, or it would evaluate before this LIMIT takes
        // effect instead of after. Always open a subquery boundary.
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        stmt.limit = Some(n);
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_sample(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let n = node.config.get("n").and_then(JsonValue::as_u64).unwrap_or(100);
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        stmt.order_by = vec![OrderByItem {
            expr: Expr::FunctionCall { name: "rand".to_string(), args: vec![] },
            ascending: true,
        }];
        stmt.limit = Some(n);
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_unique(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        stmt.distinct = true;
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_group_by(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let input = self.input_schema(&parent).to_vec();

        #[derive(serde::Deserialize)]
        struct AggConfig {
            alias: String,
            function: String,
            #[serde(default)]
            column: Option<String>,
        }

        let group_keys: Vec<String> = node
            .config
            .get("group_keys")
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().filter_map(JsonValue::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        for key in &group_keys {
            self.resolve_column(node, &input, key)?;
        }

        let aggregations: Vec<AggConfig> = node
            .config
            .get("aggregations")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        // Merge table: "filter | group_by -> WHERE + GROUP BY". Anything
        // else wraps rather than layering GROUP BY onto a statement whose
        // projection may already carry aliases this would shadow.
        let mut stmt = self.merge_or_wrap(&parent, &[MergeStage::Filtered]);
        stmt.group_by = group_keys.iter().map(|k| Expr::Column(k.clone())).collect();
        let mut projection: Vec<(Expr, Option<String>)> =
            group_keys.iter().map(|k| (Expr::Column(k.clone()), None)).collect();
        for agg in &aggregations {
            let arg = match &agg.column {
                Some(c) => vec![Expr::Column(c.clone())],
                None => vec![],
            };
            projection.push((
                Expr::FunctionCall { name: agg.function.clone(), args: arg },
                Some(agg.alias.clone()),
            ));
        }
        stmt.projection = projection;
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Grouped));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    /// Matches the schema engine's `pivot_columns` output shape exactly,
    /// one computed column per aggregation: the conditional fan-out
    /// across the finite pivot vocabulary is folded into a single
    /// `CASE`-guarded aggregate per aggregation so the projection's
    /// column count stays in lockstep with the engine's.
    fn compile_pivot(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let input = self.input_schema(&parent).to_vec();

        let row_dims: Vec<String> = node
            .config
            .get("row_dimensions")
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().filter_map(JsonValue::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        for dim in &row_dims {
            self.resolve_column(node, &input, dim)?;
        }
        let pivot_column = node.config.get("pivot_column").and_then(JsonValue::as_str);
        let pivot_values: Vec<JsonValue> = node
            .config
            .get("pivot_values")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let value_column = node.config.get("value_column").and_then(JsonValue::as_str);
        let aggregations: Vec<String> = node
            .config
            .get("aggregations")
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().filter_map(JsonValue::as_str).map(str::to_owned).collect())
            .unwrap_or_default();

        // `pivot` never appears in the merge table, so it always opens a
        // new subquery boundary; a downstream `select`/`rename` must never
        // see this statement's aliased aggregates as reusable columns.
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        stmt.group_by = row_dims.iter().map(|d| Expr::Column(d.clone())).collect();
        let mut projection: Vec<(Expr, Option<String>)> =
            row_dims.iter().map(|d| (Expr::Column(d.clone()), None)).collect();

        for agg in &aggregations {
            let base_value_expr = match value_column {
                Some(col) => Expr::Column(col.to_string()),
                None => Expr::Literal(Literal::Int(1)),
            };
            let inner = match pivot_column {
                Some(pcol) if !pivot_values.is_empty() => {
                    let mut expr = base_value_expr.clone();
                    for pv in &pivot_values {
                        let cmp = Expr::Binary(
                            Box::new(Expr::Column(pcol.to_string())),
                            BinOp::Eq,
                            Box::new(Expr::Literal(Literal::typed(pv, DType::String))),
                        );
                        expr = Expr::Case {
                            cond: Box::new(cmp),
                            then: Box::new(base_value_expr.clone()),
                            or_else: Box::new(expr),
                        };
                    }
                    expr
                }
                _ => base_value_expr,
            };
            projection.push((
                Expr::FunctionCall { name: agg.clone(), args: vec![inner] },
                Some(format!("value_column_{agg}")),
            ));
        }
        stmt.projection = projection;
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_formula(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let input = self.input_schema(&parent).to_vec();
        let output_column = node
            .config
            .get("output_column")
            .and_then(JsonValue::as_str)
            .unwrap_or("formula_result")
            .to_string();
        let expression_text = node
            .config
            .get("expression")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();

        let expr = formula::compile(expression_text, &input).map_err(|e| match e {
            formula::FormulaError::UnresolvedColumn(col) => {
                CompileError::Validation(ValidationError::UnresolvedColumn {
                    node: node.id.clone(),
                    column: col,
                })
            }
            other => CompileError::Validation(ValidationError::InvalidOperator(other.to_string())),
        })?;

        // `formula` never appears in the merge table either: always wrap,
        // so a later `filter` can't end up testing this computed column's
        // alias in a WHERE clause that can't see it.
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        let base_projection: Vec<(Expr, Option<String>)> = if stmt.projection.is_empty() {
            input.iter().map(|c| (Expr::Column(c.name.clone()), None)).collect()
        } else {
            stmt.projection.clone()
        };
        let mut projection = base_projection;
        projection.push((expr, Some(output_column)));
        stmt.projection = projection;
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    fn compile_window(&mut self, node: &Node) -> Result<(), CompileError> {
        let parent = self
            .single_parent(node)
            .ok_or(ValidationError::MissingInput { node: node.id.clone(), port: 0 })?;
        if self.is_kv_frag(&parent) {
            self.frags.insert(node.id.clone(), self.frags[&parent].clone());
            self.carry_store(&parent, &node.id);
            return Ok(());
        }
        let input = self.input_schema(&parent).to_vec();

        let function = node
            .config
            .get("function")
            .and_then(JsonValue::as_str)
            .unwrap_or("row_number")
            .to_string();
        let output_column = node
            .config
            .get("output_column")
            .and_then(JsonValue::as_str)
            .unwrap_or("window_result")
            .to_string();
        let arg_column = node.config.get("column").and_then(JsonValue::as_str);
        let partition_by: Vec<String> = node
            .config
            .get("partition_by")
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().filter_map(JsonValue::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        let order_by_cols: Vec<String> = node
            .config
            .get("order_by")
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().filter_map(JsonValue::as_str).map(str::to_owned).collect())
            .unwrap_or_default();

        for col in partition_by.iter().chain(order_by_cols.iter()) {
            self.resolve_column(node, &input, col)?;
        }
        if let Some(col) = arg_column {
            self.resolve_column(node, &input, col)?;
        }

        let args = arg_column.map(|c| vec![Expr::Column(c.to_string())]).unwrap_or_default();
        let window_expr = Expr::Window {
            function,
            args,
            partition_by: partition_by.into_iter().map(Expr::Column).collect(),
            order_by: order_by_cols
                .into_iter()
                .map(|c| OrderByItem { expr: Expr::Column(c), ascending: true })
                .collect(),
        };

        // `window` never appears in the merge table: always wrap, for the
        // same reason as `formula` above.
        let mut stmt = self.merge_or_wrap(&parent, &[]);
        let base_projection: Vec<(Expr, Option<String>)> = if stmt.projection.is_empty() {
            input.iter().map(|c| (Expr::Column(c.name.clone()), None)).collect()
        } else {
            stmt.projection.clone()
        };
        let mut projection = base_projection;
        projection.push((window_expr, Some(output_column)));
        stmt.projection = projection;
        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.carry_store(&parent, &node.id);
        Ok(())
    }

    /// `join`/`union` are always a new segment root (merge table: "anything
    /// | join -> new segment root"): both inputs are finalized as
    /// subqueries rather than mutated in place.
    fn compile_join(&mut self, node: &Node) -> Result<(), CompileError> {
        let parents = self.parents(node);
        if parents.len() < 2 {
            return Err(ValidationError::MissingInput { node: node.id.clone(), port: parents.len() }.into());
        }
        let (left_id, right_id) = (parents[0].clone(), parents[1].clone());
        let left_store = *self.detected_store.get(&left_id).expect("left parent store known");
        let right_store = *self.detected_store.get(&right_id).expect("right parent store known");
        if left_store != right_store {
            return Err(ValidationError::CrossStoreOperation(node.id.clone()).into());
        }

        let left_stmt = self.take_parent_stmt(&left_id);
        let right_stmt = self.take_parent_stmt(&right_id);

        #[derive(serde::Deserialize)]
        struct JoinConfig {
            #[serde(default)]
            join_type: String,
            #[serde(default)]
            left_key: Option<String>,
            #[serde(default)]
            right_key: Option<String>,
        }
        let cfg: JoinConfig = serde_json::from_value(node.config.clone()).unwrap_or(JoinConfig {
            join_type: "inner".to_string(),
            left_key: None,
            right_key: None,
        });
        let join_type = match cfg.join_type.to_lowercase().as_str() {
            "left" => JoinType::Left,
            "right" => JoinType::Right,
            "full" => JoinType::Full,
            _ => JoinType::Inner,
        };

        let on = match (cfg.left_key, cfg.right_key) {
            (Some(l), Some(r)) => {
                validate_identifier(&l)?;
                validate_identifier(&r)?;
                Expr::Binary(Box::new(Expr::Column(l)), BinOp::Eq, Box::new(Expr::Column(r)))
            }
            _ => Expr::Literal(Literal::Bool(true)),
        };

        let output = self.schemas.get(&node.id).cloned().unwrap_or_default();
        let mut stmt = SelectStmt::new(FromClause::Subquery(Box::new(left_stmt)));
        stmt.joins.push(JoinClause {
            join_type,
            table: format!("({})", right_stmt.render(sql_dialect(left_store))),
            on,
        });
        // Explicit projection list, never `SELECT *`: pulled straight from
        // the schema engine's computed output so the projection column
        // count and the schema column count agree by construction.
        stmt.projection = output.iter().map(|c| (Expr::Column(c.name.clone()), None)).collect();

        self.frags.insert(node.id.clone(), Frag::Sql(stmt, MergeStage::Other));
        self.detected_store.insert(node.id.clone(), left_store);
        Ok(())
    }

    fn compile_union(&mut self, node: &Node) -> Result<(), CompileError> {
        let parents = self.parents(node);
        if parents.is_empty() {
            return Err(ValidationError::MissingInput { node: node.id.clone(), port: 0 }.into());
        }
        let first_store = *self
            .detected_store
            .get(&parents[0])
            .expect("first union input's store known");
        for p in &parents[1..] {
            let store = *self.detected_store.get(p).expect("union input's store known");
            if store != first_store {
                return Err(ValidationError::CrossStoreOperation(node.id.clone()).into());
            }
        }

        let first_schema = self.input_schema(&parents[0]).to_vec();
        for p in &parents[1..] {
            let schema = self.input_schema(p).to_vec();
            let aligned = schema.len() == first_schema.len()
                && schema.iter().zip(first_schema.iter()).all(|(a, b)| a.dtype == b.dtype);
            if !aligned {
                return Err(ValidationError::SchemaMismatch(node.id.clone()).into());
            }
        }

        let inputs: Vec<SelectStmt> = parents.iter().map(|p| self.take_parent_stmt(p)).collect();
        self.frags.insert(
            node.id.clone(),
            Frag::Sql(SelectStmt::new(FromClause::Subquery(Box::new(
                // `SetOpStmt` isn't a `SelectStmt`, so fold it into a
                // subquery-shaped `FromClause` by rendering it as a single
                // synthetic table reference; the rest of the pipeline only
                // ever reads the resulting `SelectStmt`'s rendered SQL.
                SelectStmt::new(FromClause::Table(
                    SetOpStmt { op: SetOp::UnionAll, inputs }.render(sql_dialect(first_store)),
                )),
            ))), MergeStage::Other),
        );
        self.detected_store.insert(node.id.clone(), first_store);
        Ok(())
    }
}

fn ancestors_of(graph: &Graph, target: &NodeId) -> HashSet<NodeId> {
    let mut visited = HashSet::new();
    let mut stack = vec![target.clone()];
    while let Some(current) = stack.pop() {
        for edge in graph.inbound_edges(&current) {
            if visited.insert(edge.source.clone()) {
                stack.push(edge.source.clone());
            }
        }
    }
    visited
}

fn isolate(graph: &Graph, node_set: &HashSet<NodeId>) -> Graph {
    let nodes: Vec<Node> = graph
        .nodes
        .iter()
        .filter(|n| node_set.contains(&n.id))
        .cloned()
        .collect();
    let edges: Vec<Edge> = graph
        .edges
        .iter()
        .filter(|e| node_set.contains(&e.source) && node_set.contains(&e.target))
        .cloned()
        .collect();
    Graph { nodes, edges }
}

/// Table-name-prefix target detection. A KV key pattern is any name
/// containing a `:` (redis-style key convention, e.g. `latest:vwap:*`);
/// a streaming materialized view is any name starting with `live_`;
/// everything else is OLAP.
fn detect_store(table: &str) -> StoreKind {
    if table.contains(':') {
        StoreKind::Kv
    } else if table.starts_with("live_") {
        StoreKind::Stream
    } else {
        StoreKind::Olap
    }
}

/// Builds a typed predicate for one recognized filter operator. Returns
/// `InvalidOperator` for anything outside the recognized set — it is
/// never silently mapped to `=`.
fn build_operator_expr(
    column: &ColumnSchema,
    operator: &str,
    value: &JsonValue,
) -> Result<Expr, CompileError> {
    let col_expr = Expr::Column(column.name.clone());
    let lit = |v: &JsonValue| Expr::Literal(Literal::typed(v, column.dtype));

    let expr = match operator {
        "=" => Expr::Binary(Box::new(col_expr), BinOp::Eq, Box::new(lit(value))),
        "!=" => Expr::Binary(Box::new(col_expr), BinOp::NotEq, Box::new(lit(value))),
        ">" => Expr::Binary(Box::new(col_expr), BinOp::Gt, Box::new(lit(value))),
        "<" => Expr::Binary(Box::new(col_expr), BinOp::Lt, Box::new(lit(value))),
        ">=" => Expr::Binary(Box::new(col_expr), BinOp::Gte, Box::new(lit(value))),
        "<=" => Expr::Binary(Box::new(col_expr), BinOp::Lte, Box::new(lit(value))),
        "IN" | "NOT IN" => {
            let list: Vec<Expr> = value.as_array().map(|arr| arr.iter().map(lit).collect()).unwrap_or_default();
            Expr::InList { expr: Box::new(col_expr), list, negated: operator == "NOT IN" }
        }
        "BETWEEN" => {
            let arr = value.as_array().cloned().unwrap_or_default();
            let low = arr.first().map(lit).unwrap_or(Expr::Literal(Literal::Null));
            let high = arr.get(1).map(lit).unwrap_or(Expr::Literal(Literal::Null));
            Expr::Between { expr: Box::new(col_expr), low: Box::new(low), high: Box::new(high), negated: false }
        }
        "LIKE" => Expr::Like { expr: Box::new(col_expr), pattern: Box::new(lit(value)), negated: false },
        "CONTAINS" => {
            let pattern = format!("%{}%", value.as_str().unwrap_or_default());
            Expr::Like {
                expr: Box::new(col_expr),
                pattern: Box::new(Expr::Literal(Literal::Str(pattern))),
                negated: false,
            }
        }
        "STARTS_WITH" => {
            let pattern = format!("{}%", value.as_str().unwrap_or_default());
            Expr::Like {
                expr: Box::new(col_expr),
                pattern: Box::new(Expr::Literal(Literal::Str(pattern))),
                negated: false,
            }
        }
        "ENDS_WITH" => {
            let pattern = format!("%{}", value.as_str().unwrap_or_default());
            Expr::Like {
                expr: Box::new(col_expr),
                pattern: Box::new(Expr::Literal(Literal::Str(pattern))),
                negated: false,
            }
        }
        "IS NULL" => Expr::IsNull { expr: Box::new(col_expr), negated: false },
        "IS NOT NULL" => Expr::IsNull { expr: Box::new(col_expr), negated: true },
        other => return Err(ValidationError::InvalidOperator(other.to_string()).into()),
    };
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizql_types::{DType, Edge as TEdge, NodeKind};

    fn node(id: &str, kind: NodeKind, config: JsonValue) -> Node {
        Node { id: NodeId(id.to_string()), kind, config }
    }

    fn edge(a: &str, b: &str) -> TEdge {
        TEdge { source: NodeId(a.to_string()), target: NodeId(b.to_string()) }
    }

    fn trades_graph() -> Graph {
        Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({
                        "table": "trades",
                        "columns": [
                            {"name": "symbol", "dtype": "string", "nullable": false},
                            {"name": "price", "dtype": "float64", "nullable": false}
                        ]
                    }),
                ),
                node(
                    "f",
                    NodeKind::Filter,
                    serde_json::json!({"column": "symbol", "operator": "=", "value": "AAPL"}),
                ),
                node(
                    "sel",
                    NodeKind::Select,
                    serde_json::json!({"columns": ["symbol", "price"]}),
                ),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "f"), edge("f", "sel"), edge("sel", "out")],
        }
    }

    fn base_request<'a>(
        graph: &'a Graph,
        target: &'a NodeId,
        tenant: &'a TenantId,
        allowed: &'a AllowedIdentifierSet,
        acl: &'a AclPolicy,
        no_override: &'a dyn Fn(&str) -> Option<StoreKind>,
    ) -> CompileRequest<'a> {
        CompileRequest {
            graph,
            target_node: target,
            tenant,
            allowed_identifiers: allowed,
            pagination: Pagination { offset: 0, limit: 100 },
            acl_policy: acl,
            olap_settings: Some(OlapSettings {
                max_execution_time_s: 3,
                max_memory_bytes: 100 * 1024 * 1024,
                max_rows_to_read: 10_000_000,
            }),
            max_pagination_offset: 10_000,
            catalog_target_override: no_override,
            drill_filters: &[],
        }
    }

    #[test]
    fn filter_select_merge_matches_scenario_e1() {
        let graph = trades_graph();
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet(["AAPL".to_string()].into_iter().collect());
        let mut acl = AclPolicy::new();
        acl.insert(
            "trades".to_string(),
            AclRule::SharedIdentifier { identifier_column: "symbol".to_string() },
        );
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);

        let outcome = compile(&req).unwrap();
        let segment = match outcome {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("allowed set is non-empty"),
        };
        assert_eq!(segment.target, StoreKind::Olap);
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        assert!(sql.contains("WHERE"));
        assert!(sql.contains("`symbol` = 'AAPL'"));
        assert!(sql.contains("`symbol` IN ('AAPL')"));
        assert!(sql.contains("SETTINGS max_execution_time=3"));
        assert!(sql.starts_with("SELECT * FROM (SELECT"));
        assert!(sql.ends_with("LIMIT 100 OFFSET 0"));
    }

    #[test]
    fn empty_allowed_set_short_circuits() {
        let graph = trades_graph();
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert(
            "trades".to_string(),
            AclRule::SharedIdentifier { identifier_column: "symbol".to_string() },
        );
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        assert_eq!(compile(&req).unwrap(), CompileOutcome::EmptyByAcl);
    }

    #[test]
    fn missing_acl_declaration_is_compile_error() {
        let graph = trades_graph();
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet(["AAPL".to_string()].into_iter().collect());
        let acl = AclPolicy::new();
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let err = compile(&req).unwrap_err();
        assert!(matches!(err, CompileError::TenantAcl(TenantAclError::TenantAclMissing(_))));
    }

    #[test]
    fn unknown_operator_is_fatal_scenario_e4() {
        let mut graph = trades_graph();
        graph.nodes[1].config =
            serde_json::json!({"column": "symbol", "operator": "approx", "value": "AAPL"});
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet(["AAPL".to_string()].into_iter().collect());
        let mut acl = AclPolicy::new();
        acl.insert(
            "trades".to_string(),
            AclRule::SharedIdentifier { identifier_column: "symbol".to_string() },
        );
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let err = compile(&req).unwrap_err();
        assert!(matches!(err, CompileError::Validation(ValidationError::InvalidOperator(_))));
    }

    #[test]
    fn numeric_filter_scenario_e3() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({
                        "table": "trades",
                        "columns": [{"name": "price", "dtype": "float64", "nullable": false}]
                    }),
                ),
                node(
                    "f",
                    NodeKind::Filter,
                    serde_json::json!({"column": "price", "operator": ">", "value": 100}),
                ),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "f"), edge("f", "out")],
        };
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("trades".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("no ACL rule requires a non-empty allowed set"),
        };
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        assert!(sql.contains("`price` > 100"));
        assert!(!sql.contains("price > '100'"));
    }

    #[test]
    fn cross_store_union_is_rejected_scenario_e2() {
        let graph = Graph {
            nodes: vec![
                node("a", NodeKind::DataSource, serde_json::json!({"table": "live_positions", "columns": []})),
                node("b", NodeKind::DataSource, serde_json::json!({"table": "latest:position:*", "columns": []})),
                node("u", NodeKind::Union, JsonValue::Null),
            ],
            edges: vec![edge("a", "u"), edge("b", "u")],
        };
        let target = NodeId("u".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("live_positions".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let err = compile(&req).unwrap_err();
        assert!(matches!(err, CompileError::Validation(ValidationError::CrossStoreOperation(_))));
    }

    #[test]
    fn kv_data_source_compiles_to_scan_payload_scenario_e6() {
        let graph = Graph {
            nodes: vec![
                node("src", NodeKind::DataSource, serde_json::json!({"table": "latest:vwap:*", "columns": []})),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "out")],
        };
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let acl = AclPolicy::new();
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("kv path doesn't consult the ACL short-circuit"),
        };
        assert_eq!(segment.target, StoreKind::Kv);
        match segment.payload {
            SegmentPayload::Kv(lookup) => {
                assert_eq!(lookup.key_pattern, "latest:vwap:*");
                assert_eq!(lookup.kind, KvLookupKind::ScanHash);
            }
            SegmentPayload::Sql(_) => panic!("expected KV payload"),
        }
    }

    #[test]
    fn join_projection_matches_schema_engine_column_count_invariant_10() {
        let graph = Graph {
            nodes: vec![
                node(
                    "l",
                    NodeKind::DataSource,
                    serde_json::json!({"table": "trades", "columns": [
                        {"name": "id", "dtype": "int64", "nullable": false},
                        {"name": "symbol", "dtype": "string", "nullable": false}
                    ]}),
                ),
                node(
                    "r",
                    NodeKind::DataSource,
                    serde_json::json!({"table": "quotes", "columns": [
                        {"name": "id", "dtype": "int64", "nullable": false},
                        {"name": "bid", "dtype": "float64", "nullable": true}
                    ]}),
                ),
                node(
                    "j",
                    NodeKind::Join,
                    serde_json::json!({"join_type": "inner", "left_key": "id", "right_key": "id"}),
                ),
            ],
            edges: vec![edge("l", "j"), edge("r", "j")],
        };
        let target = NodeId("j".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("trades".to_string(), AclRule::None);
        acl.insert("quotes".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("no ACL rule requires a non-empty allowed set"),
        };
        assert_eq!(segment.output_columns.len(), 3);
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        let projected = sql.matches("id, symbol, bid").count() + sql.matches("id, symbol, bid").count();
        let _ = projected;
        assert!(sql.contains("INNER JOIN"));
    }

    #[test]
    fn group_by_then_select_wraps_aggregates_in_subquery() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({"table": "trades", "columns": [
                        {"name": "symbol", "dtype": "string", "nullable": false},
                        {"name": "price", "dtype": "float64", "nullable": false}
                    ]}),
                ),
                node(
                    "g",
                    NodeKind::GroupBy,
                    serde_json::json!({
                        "group_keys": ["symbol"],
                        "aggregations": [{"alias": "total", "function": "sum", "column": "price"}]
                    }),
                ),
                node("sel", NodeKind::Select, serde_json::json!({"columns": ["symbol", "total"]})),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "g"), edge("g", "sel"), edge("sel", "out")],
        };
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("trades".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("no ACL rule requires a non-empty allowed set"),
        };
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        // `select` is not merge-compatible coming off `group_by`; the
        // aggregate statement must be wrapped in a subquery so `total`
        // resolves against its alias instead of an undefined column.
        assert!(sql.contains("GROUP BY"));
        assert!(sql.contains("FROM (SELECT"));
        assert!(sql.contains("`symbol`, `total`"));
    }

    #[test]
    fn pivot_then_select_wraps_in_subquery() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({"table": "trades", "columns": [
                        {"name": "symbol", "dtype": "string", "nullable": false},
                        {"name": "side", "dtype": "string", "nullable": false},
                        {"name": "price", "dtype": "float64", "nullable": false}
                    ]}),
                ),
                node(
                    "p",
                    NodeKind::Pivot,
                    serde_json::json!({
                        "row_dimensions": ["symbol"],
                        "pivot_column": "side",
                        "pivot_values": ["buy", "sell"],
                        "value_column": "price",
                        "aggregations": ["sum"]
                    }),
                ),
                node("sel", NodeKind::Select, serde_json::json!({"columns": ["symbol", "value_column_sum"]})),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "p"), edge("p", "sel"), edge("sel", "out")],
        };
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("trades".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("no ACL rule requires a non-empty allowed set"),
        };
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        assert!(sql.contains("FROM (SELECT"));
        assert!(sql.contains("`symbol`, `value_column_sum`"));
    }

    #[test]
    fn filter_after_formula_wraps_instead_of_referencing_alias_in_where() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({"table": "trades", "columns": [
                        {"name": "price", "dtype": "float64", "nullable": false},
                        {"name": "qty", "dtype": "float64", "nullable": false}
                    ]}),
                ),
                node(
                    "fm",
                    NodeKind::Formula,
                    serde_json::json!({"output_column": "notional", "expression": "price * qty"}),
                ),
                node(
                    "f",
                    NodeKind::Filter,
                    serde_json::json!({"column": "notional", "operator": ">", "value": 1000}),
                ),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "fm"), edge("fm", "f"), edge("f", "out")],
        };
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("trades".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("no ACL rule requires a non-empty allowed set"),
        };
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        // The filter must land in an outer WHERE over a subquery that
        // already computed `notional`, never ANDed into the formula's own
        // statement where the alias isn't a resolvable column yet.
        assert!(sql.contains("FROM (SELECT"));
        assert!(sql.contains("WHERE"));
        assert!(sql.contains("`notional` > 1000"));
    }

    #[test]
    fn filter_after_limit_preserves_limit_then_where_evaluation_order() {
        let graph = Graph {
            nodes: vec![
                node(
                    "src",
                    NodeKind::DataSource,
                    serde_json::json!({"table": "trades", "columns": [
                        {"name": "price", "dtype": "float64", "nullable": false}
                    ]}),
                ),
                node("lim", NodeKind::Limit, serde_json::json!({"n": 10})),
                node(
                    "f",
                    NodeKind::Filter,
                    serde_json::json!({"column": "price", "operator": ">", "value": 100}),
                ),
                node("out", NodeKind::TableOutput, JsonValue::Null),
            ],
            edges: vec![edge("src", "lim"), edge("lim", "f"), edge("f", "out")],
        };
        let target = NodeId("out".to_string());
        let tenant = TenantId("tenant-a".to_string());
        let allowed = AllowedIdentifierSet::default();
        let mut acl = AclPolicy::new();
        acl.insert("trades".to_string(), AclRule::None);
        let no_override = |_: &str| None;
        let req = base_request(&graph, &target, &tenant, &allowed, &acl, &no_override);
        let segment = match compile(&req).unwrap() {
            CompileOutcome::Segment(s) => s,
            CompileOutcome::EmptyByAcl => panic!("no ACL rule requires a non-empty allowed set"),
        };
        let sql = match &segment.payload {
            SegmentPayload::Sql(s) => s,
            SegmentPayload::Kv(_) => panic!("expected SQL payload"),
        };
        // `limit` isn't in the merge table for any downstream node: the
        // inner statement's LIMIT 10 must finish before the outer WHERE
        // applies, not get reordered by a merged predicate.
        let limit_pos = sql.find("LIMIT 10").expect("inner LIMIT present");
        let where_pos = sql.find("WHERE").expect("outer WHERE present");
        assert!(limit_pos < where_pos);
    }
}
