//! Token issuance.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use memoh_core::validate_user_id;

use crate::auth::{create_token, AuthState};
use crate::error::Result;

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/auth/token",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Signed token", body = TokenResponse),
        (status = 400, description = "Invalid user id"),
    ),
    tag = "Auth"
)]
pub async fn get_token(
    State(state): State<AuthState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    validate_user_id(&req.user_id)?;
    let (token, expires_at) = create_token(&req.user_id, &state.jwt_secret, state.jwt_expires_in)?;
    Ok(Json(TokenResponse { token, expires_at }))
}
