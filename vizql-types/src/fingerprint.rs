//! Deterministic fingerprinting for the preview cache.
//!
//! The fingerprint must satisfy: two requests that would compile to
//! identical SQL produce identical fingerprints, and two different tenants
//! never produce the same fingerprint for the same graph. We get both for
//! free by hashing a canonical JSON document that always starts with the
//! tenant id and never admits a code path that omits it.

use sha2::{Digest, Sha256};

use crate::types::{DrillFilter, NodeId, Pagination, RequestFingerprint, TenantId};

/// One upstream node's contribution to the fingerprint: its id and its
/// config, in the topological order the compiler would visit them in.
/// Order matters and must be produced by the same toposort the compiler
/// uses.
pub struct FingerprintInput<'a> {
    pub tenant: &'a TenantId,
    pub target_node: &'a NodeId,
    pub ordered_ancestor_configs: &'a [(&'a NodeId, &'a serde_json::Value)],
    pub pagination: Pagination,
    pub drill_filters: &'a [DrillFilter],
}

pub fn compute(input: &FingerprintInput<'_>) -> RequestFingerprint {
    let mut doc = serde_json::Map::new();
    doc.insert(
        "tenant".to_string(),
        serde_json::Value::String(input.tenant.0.clone()),
    );
    doc.insert(
        "target".to_string(),
        serde_json::Value::String(input.target_node.0.clone()),
    );
    let ancestors: Vec<serde_json::Value> = input
        .ordered_ancestor_configs
        .iter()
        .map(|(id, config)| {
            serde_json::json!({
                "id": id.0,
                "config": config,
            })
        })
        .collect();
    doc.insert("ancestors".to_string(), serde_json::Value::Array(ancestors));
    doc.insert(
        "offset".to_string(),
        serde_json::Value::from(input.pagination.offset),
    );
    doc.insert(
        "limit".to_string(),
        serde_json::Value::from(input.pagination.limit),
    );
    let filters: Vec<serde_json::Value> = input
        .drill_filters
        .iter()
        .map(|f| {
            serde_json::json!({
                "column": f.column,
                "operator": f.operator,
                "value": f.value,
            })
        })
        .collect();
    doc.insert("drill_filters".to_string(), serde_json::Value::Array(filters));

    // serde_json's default `Map` is a `BTreeMap`, so key order (and hence the
    // serialized byte stream) is already canonical without a sort pass.
    let canonical = serde_json::to_vec(&serde_json::Value::Object(doc))
        .expect("fingerprint document is always serializable");

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let digest = hasher.finalize();
    RequestFingerprint(hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(s: &str) -> TenantId {
        TenantId(s.to_string())
    }

    fn node(s: &str) -> NodeId {
        NodeId(s.to_string())
    }

    #[test]
    fn different_tenants_produce_different_fingerprints() {
        let target = node("n1");
        let cfg = serde_json::json!({"table": "trades"});
        let ancestors = vec![(&node("n0"), &cfg)];
        let a = tenant("tenant-a");
        let b = tenant("tenant-b");
        let fp_a = compute(&FingerprintInput {
            tenant: &a,
            target_node: &target,
            ordered_ancestor_configs: &ancestors,
            pagination: Pagination::default(),
            drill_filters: &[],
        });
        let fp_b = compute(&FingerprintInput {
            tenant: &b,
            target_node: &target,
            ordered_ancestor_configs: &ancestors,
            pagination: Pagination::default(),
            drill_filters: &[],
        });
        assert_ne!(fp_a, fp_b);
    }

    #[test]
    fn identical_inputs_are_deterministic() {
        let target = node("n1");
        let cfg = serde_json::json!({"table": "trades"});
        let ancestors = vec![(&node("n0"), &cfg)];
        let t = tenant("tenant-a");
        let input = FingerprintInput {
            tenant: &t,
            target_node: &target,
            ordered_ancestor_configs: &ancestors,
            pagination: Pagination::default(),
            drill_filters: &[],
        };
        assert_eq!(compute(&input), compute(&input));
    }
}
