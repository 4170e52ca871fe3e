//! JWT authentication.
//!
//! HS256 tokens carrying the user id in both `sub` and `user_id`; the
//! [`AuthUser`] extractor pulls the bearer token from the Authorization
//! header and verifies it against the configured secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject, same as `user_id`.
    pub sub: String,
    pub user_id: String,
    /// Issued at (Unix timestamp).
    pub iat: u64,
    /// Expiration (Unix timestamp).
    pub exp: u64,
}

/// Create a signed token for `user_id`.
pub fn create_token(
    user_id: &str,
    secret: &str,
    expires_in: Duration,
) -> Result<(String, DateTime<Utc>), ApiError> {
    if user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user id is required".to_string()));
    }
    if secret.trim().is_empty() {
        return Err(ApiError::Internal("jwt secret is not configured".to_string()));
    }
    if expires_in.is_zero() {
        return Err(ApiError::BadRequest(
            "token lifetime must be positive".to_string(),
        ));
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let exp = now + expires_in.as_secs();
    let claims = Claims {
        sub: user_id.to_string(),
        user_id: user_id.to_string(),
        iat: now,
        exp,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("sign token: {e}")))?;

    let expires_at = Utc
        .timestamp_opt(exp as i64, 0)
        .single()
        .unwrap_or_else(Utc::now);
    Ok((token, expires_at))
}

/// Verify a token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))
}

/// Authentication configuration shared with handlers.
#[derive(Clone)]
pub struct AuthState {
    pub jwt_secret: String,
    pub jwt_expires_in: Duration,
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub claims: Claims,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_state = parts
            .extensions
            .get::<AuthState>()
            .cloned()
            .ok_or_else(|| ApiError::Internal("auth state not configured".to_string()))?;

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("expected bearer token".to_string()))?;

        let claims = verify_token(&auth_state.jwt_secret, token)?;
        let user_id = if !claims.user_id.is_empty() {
            claims.user_id.clone()
        } else {
            claims.sub.clone()
        };
        if user_id.is_empty() {
            return Err(ApiError::Unauthorized("user id missing".to_string()));
        }

        Ok(AuthUser { user_id, claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-for-unit-tests";

    #[test]
    fn create_and_verify_round_trip() {
        let (token, expires_at) =
            create_token("alice", SECRET, Duration::from_secs(3600)).unwrap();
        let claims = verify_token(SECRET, &token).unwrap();
        assert_eq!(claims.user_id, "alice");
        assert_eq!(claims.sub, "alice");
        assert!(expires_at > Utc::now());
    }

    #[test]
    fn wrong_secret_fails() {
        let (token, _) = create_token("alice", SECRET, Duration::from_secs(3600)).unwrap();
        assert!(verify_token("other-secret", &token).is_err());
    }

    #[test]
    fn garbage_token_fails() {
        assert!(verify_token(SECRET, "not.a.token").is_err());
    }

    #[test]
    fn empty_user_id_is_rejected() {
        assert!(create_token("", SECRET, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(create_token("alice", " ", Duration::from_secs(60)).is_err());
    }

    #[test]
    fn zero_lifetime_is_rejected() {
        assert!(create_token("alice", SECRET, Duration::ZERO).is_err());
    }
}
