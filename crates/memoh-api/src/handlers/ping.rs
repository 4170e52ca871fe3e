//! Liveness probe.

use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PingResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/ping",
    responses((status = 200, description = "Service is up", body = PingResponse)),
    tag = "Health"
)]
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok".to_string(),
    })
}
