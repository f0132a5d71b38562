//! Compiler failure modes: identifier validation and tenant ACL injection
//! are the two checks that can fail before a workflow is compiled to SQL.

use thiserror::Error;
use vizql_types::errors::{TenantAclError, ValidationError};

#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    TenantAcl(#[from] TenantAclError),
}

/// Re-exported so existing call sites (`use crate::errors::validate_identifier`)
/// keep working — the pattern itself lives in `vizql-types` so the schema
/// engine (`vizql-core`, which cannot depend on `vizql-sql`) can validate
/// config-derived column names at the point they're created, not just here
/// at the point they're woven into SQL.
pub use vizql_types::identifier::validate_identifier;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_dotted_identifiers() {
        assert!(validate_identifier("symbol").is_ok());
        assert!(validate_identifier("trades.symbol").is_ok());
    }

    #[test]
    fn rejects_identifiers_with_sql_metacharacters() {
        assert!(validate_identifier("symbol; DROP TABLE trades").is_err());
        assert!(validate_identifier("1symbol").is_err());
        assert!(validate_identifier("sym-bol").is_err());
    }
}
