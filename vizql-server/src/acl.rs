//! Tenant ACL policy source.
//!
//! Which tables need `identifier IN (allowed set)` vs. `tenant_id = ...`
//! vs. nothing is metadata that lives in a persistent metadata store
//! outside this crate; the allowed-identifier set itself is a per-tenant
//! entitlement that the identity provider or a separate authorization
//! service would supply. This crate only needs the trait boundary —
//! `StaticAclProvider` is an in-memory stand-in used until a real
//! authorization backend is wired in, the same way `vizql-core`'s
//! `CatalogSource` stands in for live store metadata.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use vizql_sql::{AclPolicy, AclRule, AllowedIdentifierSet};
use vizql_types::TenantId;

#[async_trait::async_trait]
pub trait AclProvider: Send + Sync {
    async fn policy(&self) -> AclPolicy;
    async fn allowed_identifiers(&self, tenant: &TenantId) -> AllowedIdentifierSet;
}

/// In-memory ACL provider: a fixed table policy plus a per-tenant
/// identifier-set map, both swappable at runtime behind a lock so an
/// operator can update entitlements without a restart.
pub struct StaticAclProvider {
    policy: RwLock<AclPolicy>,
    allowed: RwLock<HashMap<TenantId, HashSet<String>>>,
}

impl StaticAclProvider {
    pub fn new(policy: AclPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            allowed: RwLock::new(HashMap::new()),
        }
    }

    /// Demo/default policy: `trades`/`live_positions`/`latest:*` style
    /// shared tables keyed by `symbol`, metadata tables keyed by
    /// `tenant_id`. Real deployments load this from config or the
    /// metadata store instead.
    pub fn default_policy() -> AclPolicy {
        let mut policy = HashMap::new();
        policy.insert(
            "trades".to_string(),
            AclRule::SharedIdentifier {
                identifier_column: "symbol".to_string(),
            },
        );
        policy.insert(
            "live_positions".to_string(),
            AclRule::SharedIdentifier {
                identifier_column: "symbol".to_string(),
            },
        );
        policy.insert(
            "orders".to_string(),
            AclRule::TenantColumn {
                column: "tenant_id".to_string(),
            },
        );
        policy
    }

    pub fn set_allowed_identifiers(&self, tenant: TenantId, identifiers: HashSet<String>) {
        self.allowed.write().insert(tenant, identifiers);
    }
}

#[async_trait::async_trait]
impl AclProvider for StaticAclProvider {
    async fn policy(&self) -> AclPolicy {
        self.policy.read().clone()
    }

    async fn allowed_identifiers(&self, tenant: &TenantId) -> AllowedIdentifierSet {
        AllowedIdentifierSet(self.allowed.read().get(tenant).cloned().unwrap_or_default())
    }
}
