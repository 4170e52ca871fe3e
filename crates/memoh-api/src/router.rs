//! Router construction.

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Extension, Router,
};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use memoh_manager::Manager;

use crate::auth::AuthState;
use crate::handlers;
use crate::openapi::ApiDoc;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<Manager>,
}

/// Build the HTTP router.
pub fn build_router(state: ApiState, auth_state: AuthState, swagger_enabled: bool) -> Router {
    let fs_routes = Router::new()
        .route("/read", get(handlers::fs::read))
        .route("/list", get(handlers::fs::list))
        .route("/write_atomic", put(handlers::fs::write_atomic))
        .route("/apply_patch", post(handlers::fs::apply_patch))
        .route("/commit", post(handlers::fs::commit))
        .route("/diff", get(handlers::fs::diff))
        .with_state(state);

    let auth_routes = Router::new()
        .route("/token", post(handlers::auth::get_token))
        .with_state(auth_state.clone());

    let mut router = Router::new()
        .route("/ping", get(handlers::ping::ping))
        .nest("/auth", auth_routes)
        .nest("/fs", fs_routes)
        .layer(Extension(auth_state))
        .layer(TraceLayer::new_for_http());

    if swagger_enabled {
        router = router
            .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }

    router
}
