// Caller authentication for the HTTP, server-push, and duplex endpoints
// Tokens are HS256 JWTs carrying the user id and role

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::api::types::ApiError;
use crate::api::AppState;
use crate::config::AuthSettings;
use crate::{ForgeError, Result};

/// Caller role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    /// Admins and editors may create runs and answer reviews
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::Editor)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ForgeError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(ForgeError::InvalidInput(format!("unknown role '{}'", other))),
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    /// Owners and admins may see a run
    pub fn can_access(&self, owner_id: &str) -> bool {
        self.role.is_admin() || self.user_id == owner_id
    }

    pub fn require_write(&self) -> Result<()> {
        if self.role.can_write() {
            Ok(())
        } else {
            Err(ForgeError::Forbidden(format!(
                "role '{}' cannot modify generations",
                self.role
            )))
        }
    }
}

/// Resolves a bearer token to an identity
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    iat: usize,
    exp: usize,
}

/// HS256 JWT provider that can also mint tokens
pub struct JwtAuthProvider {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl_secs: u64,
}

impl JwtAuthProvider {
    pub fn new(settings: &AuthSettings) -> Self {
        let secret = settings.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            token_ttl_secs: settings.token_ttl_secs,
        }
    }

    /// Mint a token for an identity
    pub fn issue(&self, identity: &Identity) -> Result<String> {
        let now = Utc::now().timestamp().max(0) as usize;
        let claims = Claims {
            sub: identity.user_id.clone(),
            role: identity.role,
            iat: now,
            exp: now + self.token_ttl_secs as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ForgeError::Internal(format!("failed to sign token: {}", e)))
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn authenticate(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!("Rejected token: {}", e);
            ForgeError::Authentication("invalid or expired token".to_string())
        })?;
        Ok(Identity::new(data.claims.sub, data.claims.role))
    }
}

/// Token from `Authorization: Bearer ...`, falling back to `?token=`
///
/// Browsers cannot set headers on `EventSource` or WebSocket requests, so the query
/// parameter is accepted on every route.
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    from_header.or_else(|| parts.uri.query().and_then(token_from_query))
}

/// Extract and decode `token=` from a raw query string
pub fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Extractor for routes that require a caller identity
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or_else(|| {
            ApiError(ForgeError::Authentication(
                "missing bearer token".to_string(),
            ))
        })?;
        let identity = state.auth.authenticate(&token).await?;
        Ok(AuthenticatedUser(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn provider() -> JwtAuthProvider {
        JwtAuthProvider::new(&AuthSettings {
            jwt_secret: "test-secret".to_string(),
            token_ttl_secs: 3600,
        })
    }

    fn parts(uri: &str, bearer: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_issued_token_authenticates() {
        let provider = provider();
        let identity = Identity::new("user-1", Role::Editor);
        let token = provider.issue(&identity).unwrap();
        assert_eq!(provider.authenticate(&token).await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_foreign_token_is_rejected() {
        let other = JwtAuthProvider::new(&AuthSettings {
            jwt_secret: "other-secret".to_string(),
            token_ttl_secs: 3600,
        });
        let token = other.issue(&Identity::new("user-1", Role::Admin)).unwrap();
        let err = provider().authenticate(&token).await.unwrap_err();
        assert!(matches!(err, ForgeError::Authentication(_)));
        assert!(provider().authenticate("garbage").await.is_err());
    }

    #[test]
    fn test_token_lookup_prefers_header() {
        assert_eq!(
            token_from_parts(&parts("/x?token=query", Some("header"))).as_deref(),
            Some("header")
        );
        assert_eq!(
            token_from_parts(&parts("/x?a=1&token=a%2Bb", None)).as_deref(),
            Some("a+b")
        );
        assert_eq!(token_from_parts(&parts("/x?token=", None)), None);
    }

    #[test]
    fn test_role_permissions() {
        assert!(Role::Editor.can_write());
        assert!(!Role::Viewer.can_write());
        assert!(Identity::new("u", Role::Admin).can_access("someone-else"));
        assert!(!Identity::new("u", Role::Editor).can_access("someone-else"));
        assert_eq!("VIEWER".parse::<Role>().unwrap(), Role::Viewer);
    }
}
