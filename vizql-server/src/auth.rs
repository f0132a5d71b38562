//! Bearer token extraction: the request layer's one job before handing
//! control to the core — turn a signed token into
//! `{ tenantID, userID, roles }`.

use actix_web::dev::ServiceRequest;
use actix_web::{Error as ActixError, HttpMessage};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use vizql_types::{Roles, TenantId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: usize,
}

/// Identity extracted from a bearer token, passed explicitly into every
/// core call from here on — this is the one place a `TenantId` is allowed
/// to originate from untrusted input; everything downstream treats it as
/// an opaque, already-verified value.
#[derive(Debug, Clone)]
pub struct Identity {
    pub tenant: TenantId,
    pub user: UserId,
    pub roles: Roles,
}

impl From<Claims> for Identity {
    fn from(c: Claims) -> Self {
        Identity {
            tenant: TenantId(c.tenant_id),
            user: UserId(c.user_id),
            roles: Roles(c.roles),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("bearer token missing or malformed")]
    Malformed,
    #[error("bearer token failed verification: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("development mode bypass is not permitted: explicit development flag is unset")]
    DevBypassRefused,
}

/// Verifies and decodes a bearer token against `signing_key`. In
/// development mode only, a literal `dev:<tenant>:<user>` token bypasses
/// signature verification entirely; outside development mode this bypass
/// is refused.
pub fn authenticate(
    token: &str,
    signing_key: &str,
    development_mode: bool,
) -> Result<Identity, AuthError> {
    if let Some(rest) = token.strip_prefix("dev:") {
        if !development_mode {
            return Err(AuthError::DevBypassRefused);
        }
        let mut parts = rest.splitn(2, ':');
        let tenant = parts.next().ok_or(AuthError::Malformed)?;
        let user = parts.next().unwrap_or("dev-user");
        return Ok(Identity {
            tenant: TenantId(tenant.to_string()),
            user: UserId(user.to_string()),
            roles: Roles(vec!["developer".to_string()]),
        });
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(signing_key.as_bytes()),
        &validation,
    )?;
    Ok(decoded.claims.into())
}

/// `actix-web-httpauth` validator hook: resolves the bearer token into an
/// [`Identity`] and stashes it in the request extensions for handlers to
/// pull out.
pub async fn validate(
    req: ServiceRequest,
    credentials: BearerAuth,
) -> Result<ServiceRequest, (ActixError, ServiceRequest)> {
    let state = req
        .app_data::<actix_web::web::Data<crate::state::AppState>>()
        .cloned();
    let Some(state) = state else {
        return Err((
            actix_web::error::ErrorInternalServerError("server state not configured"),
            req,
        ));
    };

    match authenticate(
        credentials.token(),
        &state.config.secrets.bearer_signing_key,
        state.config.development.enabled,
    ) {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            Ok(req)
        }
        Err(e) => Err((actix_web::error::ErrorUnauthorized(e.to_string()), req)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_bypass_refused_when_development_mode_off() {
        let err = authenticate("dev:tenant-a:alice", "k", false).unwrap_err();
        assert!(matches!(err, AuthError::DevBypassRefused));
    }

    #[test]
    fn dev_bypass_allowed_in_development_mode() {
        let identity = authenticate("dev:tenant-a:alice", "k", true).unwrap();
        assert_eq!(identity.tenant, TenantId("tenant-a".to_string()));
        assert_eq!(identity.user, UserId("alice".to_string()));
    }

    #[test]
    fn malformed_dev_token_without_tenant_is_rejected() {
        let err = authenticate("not-a-real-token", "k", true).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[test]
    fn signed_token_round_trips() {
        use jsonwebtoken::{encode, EncodingKey, Header};
        let claims = Claims {
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            roles: vec!["viewer".to_string()],
            exp: 9_999_999_999,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"k")).unwrap();
        let identity = authenticate(&token, "k", false).unwrap();
        assert_eq!(identity.tenant, TenantId("t1".to_string()));
        assert_eq!(identity.roles, Roles(vec!["viewer".to_string()]));
    }
}
