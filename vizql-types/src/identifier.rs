//! The safe-identifier pattern, shared by the schema engine (which
//! validates every config-derived name at the
//! point it becomes a [`crate::types::ColumnSchema`] name) and the SQL
//! compiler (which validates table/ACL-column identifiers before they're
//! woven into a rendered query).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ValidationError;

/// `^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$` — plain or
/// dotted (`table.column`) identifiers only; no quoting, whitespace, or
/// SQL metacharacters.
static IDENTIFIER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex is valid")
});

pub fn validate_identifier(identifier: &str) -> Result<(), ValidationError> {
    if IDENTIFIER_PATTERN.is_match(identifier) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier(identifier.to_string()))
    }
}

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
