use thiserror::Error;

/// Cache-layer configuration failures. Execution failures flow through
/// [`vizql_types::errors::CoreError`] unchanged — the cache is a
/// transparent layer in front of the compute closure, not a second error
/// taxonomy for store failures.
#[derive(Error, Debug)]
pub enum CacheConfigError {
    #[error("cache ttl must be greater than zero")]
    ZeroTtl,
}
