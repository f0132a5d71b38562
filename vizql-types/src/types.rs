//! Core data model shared by every component of the engine.
//!
//! These types are intentionally storage-agnostic: they describe the shape of
//! a request, not how any particular crate persists or transmits it.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Opaque tenant identifier, threaded explicitly through every call that
/// touches catalog data, compiled SQL, cache keys or pub/sub channel names.
///
/// Never store this in a process-wide/thread-local variable — a single call
/// site that forgets to pass it along is a cross-tenant data leak.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles(pub Vec<String>);

impl Roles {
    pub fn has(&self, role: &str) -> bool {
        self.0.iter().any(|r| r == role)
    }
}

/// `NodeId` is an author-assigned identifier, not an index into any
/// particular graph's node list — graphs are authored, not object graphs,
/// so we always resolve nodes by this id through a lookup map rather than
/// through pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supported column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    String,
    Int64,
    Float64,
    Bool,
    Datetime,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub dtype: DType,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, dtype: DType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable,
            description: None,
        }
    }

    /// Structural equality used by the schema-parity property: name, dtype
    /// and nullable must match exactly. `description` is documentation, not
    /// schema, and is excluded.
    pub fn schema_eq(&self, other: &ColumnSchema) -> bool {
        self.name == other.name && self.dtype == other.dtype && self.nullable == other.nullable
    }
}

/// Which backing store a table (or compiled segment) lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Olap,
    Stream,
    Kv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub database: String,
    pub source: StoreKind,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The closed set of node kinds the schema engine and compiler understand.
/// Using an enum rather than a string-keyed runtime registry makes the
/// supported set discoverable at compile time and avoids the test-isolation
/// hazards of a global mutable registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    DataSource,
    Filter,
    Sort,
    Limit,
    Sample,
    Unique,
    Select,
    Rename,
    Join,
    Union,
    GroupBy,
    Pivot,
    Formula,
    Window,
    ChartOutput,
    TableOutput,
    KpiOutput,
}

impl NodeKind {
    pub const ALL: [NodeKind; 17] = [
        NodeKind::DataSource,
        NodeKind::Filter,
        NodeKind::Sort,
        NodeKind::Limit,
        NodeKind::Sample,
        NodeKind::Unique,
        NodeKind::Select,
        NodeKind::Rename,
        NodeKind::Join,
        NodeKind::Union,
        NodeKind::GroupBy,
        NodeKind::Pivot,
        NodeKind::Formula,
        NodeKind::Window,
        NodeKind::ChartOutput,
        NodeKind::TableOutput,
        NodeKind::KpiOutput,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeKind::ChartOutput | NodeKind::TableOutput | NodeKind::KpiOutput
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_string());
        f.write_str(&s)
    }
}

/// A node's config is free-form: which keys are recognized depends on
/// `kind`. Validated and consumed by the schema engine's transform for
/// that kind, and later by the compiler's AST builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn inbound_edges(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| &e.target == id)
    }

    pub fn outbound_edges(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| &e.source == id)
    }
}

/// SQL dialect a compiled segment renders to. `Kv` segments carry no SQL at
/// all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OlapHttp,
    StreamPgwire,
    Kv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvLookup {
    pub kind: KvLookupKind,
    pub key_pattern: String,
    /// How to derive the logical row identifier from a matched key, e.g.
    /// "suffix after last ':'".
    pub identifier_extractor: String,
    /// Downstream `filter`/`sort`/`limit` nodes chained after a KV
    /// `data_source` carry no SQL; the compiler records them here in
    /// visitation order and the router applies them in-process once the
    /// scan+fetch has materialized rows.
    #[serde(default)]
    pub post_ops: Vec<PostFetchOp>,
}

/// One row-level operation the router applies after a KV scan+fetch, since
/// downstream filters/sorts/limits on a KV segment are applied in-process
/// post-fetch. `operator` is validated against the same recognized set the
/// SQL compiler uses (`FilterOp`) at compile time, so an unrecognized
/// operator still fails the compile rather than being silently skipped at
/// execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PostFetchOp {
    Filter {
        column: String,
        operator: String,
        value: JsonValue,
    },
    Sort {
        column: String,
        ascending: bool,
    },
    Limit(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvLookupKind {
    ScanHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentPayload {
    Sql(String),
    Kv(KvLookup),
}

/// Output of the workflow compiler. Immutable once produced; a
/// `CompiledSegment` is request-scoped and may be memoized by fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledSegment {
    pub target: StoreKind,
    pub dialect: Dialect,
    pub payload: SegmentPayload,
    pub output_columns: Vec<ColumnSchema>,
    pub tenant_binding: TenantId,
}

/// Deterministic content hash identifying a preview request. Always
/// includes the tenant id — omitting it is the textbook cross-tenant
/// cache collision bug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint(pub String);

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub dtype: DType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<IndexMap<String, JsonValue>>,
    pub total_estimate: Option<u64>,
    pub execution_millis: u64,
    pub cache_hit: bool,
    pub truncated: bool,
    /// Set when served past its TTL under the stale-serving policy.
    /// Always `false` on a fresh execution.
    pub stale: bool,
}

/// `Preview` vs. `Widget` selects resource bounds and cache TTL defaults
/// from one shared code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestProfile {
    Preview,
    Widget,
}

/// Pagination parameters as supplied by a caller, pre-bounds-checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Wire representation of a node before it is matched against the closed
/// [`NodeKind`] set. Authored graphs arrive as free-form JSON from the
/// canvas; `kind` is only a string until [`Graph::try_from_raw`] resolves it,
/// which is the one place `UnknownNodeType` can be raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNode {
    pub id: NodeId,
    pub kind: String,
    #[serde(default)]
    pub config: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGraph {
    pub nodes: Vec<RawNode>,
    pub edges: Vec<Edge>,
}

fn node_kind_from_str(s: &str) -> Option<NodeKind> {
    NodeKind::ALL.iter().copied().find(|k| k.to_string() == s)
}

impl Graph {
    /// Resolves every node's string `kind` against the closed [`NodeKind`]
    /// set. Returns the offending `(NodeId, kind string)` pairs for any
    /// node whose kind does not match a supported type.
    pub fn try_from_raw(raw: RawGraph) -> Result<Graph, Vec<(NodeId, String)>> {
        let mut unknown = Vec::new();
        let mut nodes = Vec::with_capacity(raw.nodes.len());
        for raw_node in raw.nodes {
            match node_kind_from_str(&raw_node.kind) {
                Some(kind) => nodes.push(Node {
                    id: raw_node.id,
                    kind,
                    config: raw_node.config,
                }),
                None => unknown.push((raw_node.id, raw_node.kind)),
            }
        }
        if !unknown.is_empty() {
            return Err(unknown);
        }
        Ok(Graph {
            nodes,
            edges: raw.edges,
        })
    }
}

/// A single structured filter applied at drill-down time; distinct from
/// the compiler's `filter` node config because these arrive at request
/// time, not authoring time. Folded into the fingerprint and, by the
/// compiler, into an extra `WHERE` predicate for SQL segments or an extra
/// [`PostFetchOp::Filter`] for KV segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillFilter {
    pub column: String,
    pub operator: String,
    pub value: JsonValue,
}
