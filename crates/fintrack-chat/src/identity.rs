use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use thiserror::Error;

use fintrack_shared::domain::{Principal, UserId};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("auth token is malformed")]
    Malformed,
    #[error("auth token carries no subject")]
    MissingSubject,
}

/// Derives the authenticated principal from the current session token. Pure:
/// no I/O beyond reading the token. Any concrete token format can implement
/// this; the session resolves the principal exactly once.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// Resolver for `header.claims.signature`-shaped tokens. Only the claims
/// segment is read; signature verification happens at the auth server, not
/// here.
pub struct ClaimsTokenResolver;

impl IdentityResolver for ClaimsTokenResolver {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
        let claims_segment = token.split('.').nth(1).ok_or(IdentityError::Malformed)?;
        let raw = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|_| IdentityError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&raw).map_err(|_| IdentityError::Malformed)?;

        if claims.sub.is_empty() {
            return Err(IdentityError::MissingSubject);
        }

        let display_name = claims.name.unwrap_or_else(|| claims.sub.clone());
        Ok(Principal {
            id: UserId::new(claims.sub),
            display_name,
            is_privileged: claims.role.as_deref() == Some("admin"),
        })
    }
}

#[cfg(test)]
pub(crate) fn make_token(sub: &str, name: &str, role: Option<&str>) -> String {
    let claims = match role {
        Some(role) => format!(r#"{{"sub":"{sub}","name":"{name}","role":"{role}"}}"#),
        None => format!(r#"{{"sub":"{sub}","name":"{name}"}}"#),
    };
    format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(claims))
}
