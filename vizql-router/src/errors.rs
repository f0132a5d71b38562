//! Router/executor failure taxonomy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("execution exceeded deadline of {0:?}")]
    Timeout(std::time::Duration),
    #[error("execution exceeded a configured resource bound: {0}")]
    ResourceExceeded(String),
    #[error("store {0:?} is unavailable")]
    StoreUnavailable(String),
    #[error("store returned an error: {0}")]
    StoreError(String),
    #[error("request was cancelled")]
    Cancelled,
}

impl From<ExecutorError> for vizql_types::errors::CoreError {
    fn from(e: ExecutorError) -> Self {
        use vizql_types::errors::{CoreError, ResourceError, StoreError as CoreStoreError};
        match e {
            ExecutorError::Timeout(d) => CoreError::Resource(ResourceError::Timeout(d)),
            ExecutorError::ResourceExceeded(msg) => {
                CoreError::Resource(ResourceError::ResourceExceeded(msg))
            }
            ExecutorError::StoreUnavailable(store) => {
                CoreError::Store(CoreStoreError::StoreUnavailable(store))
            }
            ExecutorError::StoreError(detail) => CoreError::Store(CoreStoreError::StoreError(detail)),
            ExecutorError::Cancelled => CoreError::Store(CoreStoreError::Cancelled),
        }
    }
}
