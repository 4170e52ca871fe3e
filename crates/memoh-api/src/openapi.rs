//! OpenAPI document.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::error::ErrorResponse;
use crate::handlers::auth::{TokenRequest, TokenResponse};
use crate::handlers::fs::{
    ApplyPatchRequest, CommitResponse, DiffResponse, FileEntry, ListResponse, ReadResponse,
    WriteAtomicRequest,
};
use crate::handlers::ping::PingResponse;

use crate::handlers::auth::__path_get_token;
use crate::handlers::fs::{
    __path_apply_patch, __path_commit, __path_diff, __path_list, __path_read,
    __path_write_atomic,
};
use crate::handlers::ping::__path_ping;

/// Adds the bearer JWT security scheme.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// memoh API documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "memoh API",
        description = "Per-user sandbox filesystem and versioning API",
        license(name = "Apache-2.0"),
    ),
    paths(ping, get_token, read, list, write_atomic, apply_patch, commit, diff),
    components(schemas(
        PingResponse,
        TokenRequest,
        TokenResponse,
        ReadResponse,
        FileEntry,
        ListResponse,
        WriteAtomicRequest,
        ApplyPatchRequest,
        CommitResponse,
        DiffResponse,
        ErrorResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Auth", description = "Token issuance"),
        (name = "Filesystem", description = "Data-mount file operations"),
        (name = "Versions", description = "Snapshot versioning"),
    )
)]
pub struct ApiDoc;
