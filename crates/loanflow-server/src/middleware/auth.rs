//! Caller identity.
//!
//! The request pipeline resolves a bearer token against the configured
//! static tokens and stores the resulting [`Principal`] in the request
//! extensions. Handlers then ask for it through the extractors below.

use std::convert::Infallible;

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::{HeaderMap, header, request::Parts};
use loanflow_core::AuthConfig;

use crate::error::ApiError;

pub const ROLE_ADMIN: &str = "admin";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: String,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// Resolve the caller from an `Authorization: Bearer ...` header.
pub fn resolve_principal(headers: &HeaderMap, auth: &AuthConfig) -> Option<Principal> {
    let token = extract_bearer(headers)?;
    auth.lookup(token).map(|t| Principal {
        user_id: t.user_id.clone(),
        role: t.role.clone(),
    })
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for Principal {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<Principal>().cloned())
    }
}

/// An authenticated caller with the admin role.
#[derive(Clone, Debug)]
pub struct AdminPrincipal(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for AdminPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let principal = <Principal as FromRequestParts<S>>::from_request_parts(parts, state).await?;
        if !principal.is_admin() {
            return Err(ApiError::Forbidden);
        }
        Ok(AdminPrincipal(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use loanflow_core::StaticToken;

    fn auth() -> AuthConfig {
        AuthConfig {
            tokens: vec![
                StaticToken {
                    token: "user-token".to_string(),
                    user_id: "u1".to_string(),
                    role: "user".to_string(),
                },
                StaticToken {
                    token: "admin-token".to_string(),
                    user_id: "a1".to_string(),
                    role: "admin".to_string(),
                },
            ],
        }
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_resolves_known_token() {
        let principal = resolve_principal(&headers("Bearer admin-token"), &auth()).unwrap();
        assert_eq!(principal.user_id, "a1");
        assert!(principal.is_admin());
    }

    #[test]
    fn test_unknown_or_malformed_tokens() {
        assert_eq!(resolve_principal(&headers("Bearer nope"), &auth()), None);
        assert_eq!(resolve_principal(&headers("Basic user-token"), &auth()), None);
        assert_eq!(resolve_principal(&headers("Bearer   "), &auth()), None);
        assert_eq!(resolve_principal(&HeaderMap::new(), &auth()), None);
    }
}
