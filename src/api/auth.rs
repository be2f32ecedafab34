// =============================================================================
// Bearer Token Authentication — HS256 JWT extractor
// =============================================================================
//
// Tokens are HS256 JWTs signed with the configured secret, `sub` carrying
// the user id, valid for seven days. The extractor rejects with a structured
// 401 before the handler body executes.
//
// Usage:
//
//   async fn handler(claims: AuthClaims, ...) { ... }
//
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::app_state::AppState;

/// Token lifetime: seven days.
const TOKEN_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry as a UNIX timestamp.
    pub exp: usize,
    /// Issued-at as a UNIX timestamp.
    pub iat: usize,
}

/// Mint a bearer token for `sub`. Used by ops tooling and tests.
pub fn issue_token(secret: &str, sub: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_string(),
        exp: (now + TOKEN_TTL_SECS) as usize,
        iat: now as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validate a bearer token against the secret.
pub fn validate_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(decoded.claims)
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor guarding authenticated endpoints.
pub struct AuthClaims(pub Claims);

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthClaims {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.read().jwt_secret.clone() else {
            warn!("JWT_SECRET is not configured — authenticated requests rejected");
            return Err(AuthRejection {
                message: "server authentication not configured",
            });
        };

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        let Some(token) = token else {
            return Err(AuthRejection {
                message: "missing bearer token",
            });
        };

        match validate_token(&secret, token) {
            Ok(claims) => Ok(AuthClaims(claims)),
            Err(e) => {
                warn!(error = %e, "invalid bearer token presented");
                Err(AuthRejection {
                    message: "invalid or expired token",
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_validate_roundtrip() {
        let token = issue_token("secret-1", "user-42").unwrap();
        let claims = validate_token("secret-1", &token).unwrap();
        assert_eq!(claims.sub, "user-42");
        assert!(claims.exp > Utc::now().timestamp() as usize);
        // Seven-day expiry window.
        let ttl = claims.exp - claims.iat;
        assert_eq!(ttl, TOKEN_TTL_SECS as usize);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token("secret-1", "user-42").unwrap();
        assert!(validate_token("secret-2", &token).is_err());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(validate_token("secret", "not.a.jwt").is_err());
    }
}
