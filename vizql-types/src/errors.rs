//! Error taxonomy shared across the workspace.
//!
//! Each component crate defines its own narrow error enum for the failures
//! only it can produce, then forwards into [`CoreError`] via `#[from]`.

use thiserror::Error;

use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("graph contains a cycle through node(s): {0:?}")]
    CycleDetected(Vec<NodeId>),
    #[error("node {node} has unregistered type {type_name}")]
    UnknownNodeType { node: NodeId, type_name: String },
    #[error("node {node} is missing required input on port {port}")]
    MissingInput { node: NodeId, port: usize },
    #[error("union inputs at node {0} have mismatched schemas")]
    SchemaMismatch(NodeId),
    #[error("node {0} mixes inputs from more than one backing store")]
    CrossStoreOperation(NodeId),
    #[error("operator {0:?} is not recognized")]
    InvalidOperator(String),
    #[error("column {column} referenced by node {node} is not present in its input schema")]
    UnresolvedColumn { node: NodeId, column: String },
    #[error("identifier {0:?} failed validation against the safe-identifier pattern")]
    InvalidIdentifier(String),
}

#[derive(Error, Debug)]
pub enum TenantAclError {
    #[error("tenant {0} has no allowed-identifier set for a shared table that requires one")]
    TenantAclMissing(String),
    #[error("tenant {caller} is not authorized to read table {table}")]
    UnauthorizedTenant { caller: String, table: String },
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("execution exceeded deadline of {0:?}")]
    Timeout(std::time::Duration),
    #[error("execution exceeded a configured resource bound: {0}")]
    ResourceExceeded(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store {0:?} is unavailable")]
    StoreUnavailable(String),
    #[error("store returned an error: {0}")]
    StoreError(String),
    #[error("request was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    TenantAcl(#[from] TenantAclError),
    #[error("requested entity was not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A condition that must be unreachable by construction: SQL produced
    /// without mandatory ACL injection, or a cache collision across
    /// tenants. Fatal for the request; logged at `error!`; the process
    /// keeps serving other requests.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
}

impl CoreError {
    /// Maps each variant to the HTTP status a thin request layer should
    /// surface, without the core crate depending on any particular web
    /// framework.
    pub fn status_hint(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::TenantAcl(TenantAclError::TenantAclMissing(_)) => 403,
            CoreError::TenantAcl(TenantAclError::UnauthorizedTenant { .. }) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::Resource(_) => 400,
            CoreError::Store(StoreError::StoreUnavailable(_)) => 503,
            CoreError::Store(StoreError::StoreError(_)) => 500,
            CoreError::Store(StoreError::Cancelled) => 499,
            CoreError::InternalInvariantViolation(_) => 500,
        }
    }
}
