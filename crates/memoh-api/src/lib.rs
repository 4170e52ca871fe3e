//! HTTP surface for memoh.
//!
//! Thin authenticated entry points over the manager and the FS operations:
//! each handler validates the user id from the bearer token, acquires a
//! short-lived snapshot mount where needed, calls exactly one manager or FS
//! operation and maps errors to status codes.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod openapi;
pub mod router;
pub mod server;

pub use auth::{create_token, verify_token, AuthState, AuthUser, Claims};
pub use error::{ApiError, Result};
pub use router::{build_router, ApiState};
pub use server::ApiServer;
