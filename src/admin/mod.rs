//! Admin control surface.
//!
//! JSON over HTTP against the registry: whole-config get/update, per-service
//! and per-backend stats, config and lifecycle operations. Unauthenticated;
//! bind it somewhere private.

pub mod handlers;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::registry::ServiceRegistry;

use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<ServiceRegistry>,
}

pub fn router(registry: Arc<ServiceRegistry>) -> Router {
    Router::new()
        .route("/", get(get_stats).put(post_config).post(post_config))
        .route(
            "/_config",
            get(get_config).put(post_config).post(post_config),
        )
        .route("/_stats", get(get_stats))
        .route(
            "/{service}",
            get(get_service_stats)
                .put(post_service)
                .post(post_service)
                .delete(delete_service),
        )
        .route("/{service}/_config", get(get_service_config))
        .route("/{service}/_stats", get(get_service_stats))
        .route(
            "/{service}/{backend}",
            get(get_backend_stats)
                .put(post_backend)
                .post(post_backend)
                .delete(delete_backend),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState { registry })
}
