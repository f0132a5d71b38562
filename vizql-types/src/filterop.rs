//! The recognized filter-operator set.
//!
//! Shared by the SQL compiler, which turns one of these into a typed `Expr`
//! predicate, and by the router's KV post-fetch evaluator, which applies the
//! same operator directly to fetched rows. Keeping one list in one place
//! means a newly recognized operator (or a typo caught as unrecognized)
//! behaves identically on both dispatch paths — the same discipline the
//! schema engine and compiler already share for topological order.

use serde_json::Value as JsonValue;

pub const RECOGNIZED_OPERATORS: &[&str] = &[
    "=",
    "!=",
    ">",
    "<",
    ">=",
    "<=",
    "IN",
    "NOT IN",
    "BETWEEN",
    "LIKE",
    "CONTAINS",
    "STARTS_WITH",
    "ENDS_WITH",
    "IS NULL",
    "IS NOT NULL",
];

pub fn is_recognized_operator(operator: &str) -> bool {
    RECOGNIZED_OPERATORS.contains(&operator)
}

/// Row-level evaluation of one recognized operator against a fetched JSON
/// value, for the KV post-fetch path. `column_value` is
/// whatever was decoded for that column on this row; `None` means the row
/// had no value for the column, which only `IS NULL`/`IS NOT NULL` can match
/// meaningfully.
pub fn evaluate(operator: &str, column_value: Option<&JsonValue>, filter_value: &JsonValue) -> bool {
    match operator {
        "IS NULL" => column_value.is_none() || column_value == Some(&JsonValue::Null),
        "IS NOT NULL" => !matches!(column_value, None | Some(JsonValue::Null)),
        _ => {
            let Some(cv) = column_value else { return false };
            match operator {
                "=" => cv == filter_value,
                "!=" => cv != filter_value,
                ">" => compare_numeric(cv, filter_value).map(|o| o.is_gt()).unwrap_or(false),
                "<" => compare_numeric(cv, filter_value).map(|o| o.is_lt()).unwrap_or(false),
                ">=" => compare_numeric(cv, filter_value).map(|o| o.is_ge()).unwrap_or(false),
                "<=" => compare_numeric(cv, filter_value).map(|o| o.is_le()).unwrap_or(false),
                "IN" => filter_value.as_array().map(|a| a.contains(cv)).unwrap_or(false),
                "NOT IN" => !filter_value.as_array().map(|a| a.contains(cv)).unwrap_or(false),
                "BETWEEN" => {
                    let arr = filter_value.as_array();
                    let low = arr.and_then(|a| a.first());
                    let high = arr.and_then(|a| a.get(1));
                    match (low, high) {
                        (Some(low), Some(high)) => {
                            compare_numeric(cv, low).map(|o| o.is_ge()).unwrap_or(false)
                                && compare_numeric(cv, high).map(|o| o.is_le()).unwrap_or(false)
                        }
                        _ => false,
                    }
                }
                "LIKE" => like_match(cv, filter_value, |s| s.to_string()),
                "CONTAINS" => like_match(cv, filter_value, |s| format!("%{s}%")),
                "STARTS_WITH" => like_match(cv, filter_value, |s| format!("{s}%")),
                "ENDS_WITH" => like_match(cv, filter_value, |s| format!("%{s}")),
                _ => false,
            }
        }
    }
}

fn compare_numeric(a: &JsonValue, b: &JsonValue) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

/// `LIKE`-style matching with `%` wildcards, reduced to prefix/suffix/substring
/// checks (the only patterns the compiler's own operators ever generate).
fn like_match(cv: &JsonValue, filter_value: &JsonValue, to_pattern: impl Fn(&str) -> String) -> bool {
    let (Some(cv), Some(raw)) = (cv.as_str(), filter_value.as_str()) else {
        return false;
    };
    let pattern = to_pattern(raw);
    match (pattern.starts_with('%'), pattern.ends_with('%')) {
        (true, true) => cv.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => cv.ends_with(&pattern[1..]),
        (false, true) => cv.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) => cv == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_operator_is_rejected() {
        assert!(!is_recognized_operator("~="));
        assert!(is_recognized_operator("CONTAINS"));
    }

    #[test]
    fn numeric_comparisons_use_numeric_ordering_not_string_ordering() {
        let cv = JsonValue::from(9);
        let fv = JsonValue::from(10);
        assert!(evaluate("<", Some(&cv), &fv));
        assert!(!evaluate(">", Some(&cv), &fv));
    }

    #[test]
    fn is_null_matches_missing_and_explicit_null() {
        assert!(evaluate("IS NULL", None, &JsonValue::Null));
        assert!(evaluate("IS NULL", Some(&JsonValue::Null), &JsonValue::Null));
        assert!(!evaluate("IS NULL", Some(&JsonValue::from(1)), &JsonValue::Null));
    }

    #[test]
    fn contains_wraps_pattern_on_both_sides() {
        let cv = JsonValue::from("AAPL.US");
        let fv = JsonValue::from("APL");
        assert!(evaluate("CONTAINS", Some(&cv), &fv));
    }

    #[test]
    fn in_list_checks_membership() {
        let cv = JsonValue::from("NYSE");
        let fv = serde_json::json!(["NYSE", "NASDAQ"]);
        assert!(evaluate("IN", Some(&cv), &fv));
        assert!(!evaluate("NOT IN", Some(&cv), &fv));
    }
}
