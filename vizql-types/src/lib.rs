pub mod config;
pub mod errors;
pub mod filterop;
pub mod fingerprint;
pub mod identifier;
pub mod types;

pub use errors::CoreError;
pub use identifier::validate_identifier;
pub use types::{
    ColumnMeta, ColumnSchema, CompiledSegment, DType, Dialect, DrillFilter, Edge, Graph, KvLookup,
    KvLookupKind, Node, NodeId, NodeKind, Pagination, PostFetchOp, PreviewResult, RawGraph,
    RawNode, RequestFingerprint, RequestProfile, Roles, SegmentPayload, StoreKind, TableSchema,
    TenantId, UserId,
};
