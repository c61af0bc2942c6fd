use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;

use crate::config::{BackendConfig, Config, ServiceConfig};
use crate::registry::RegistryError;

use super::AdminState;

fn error_response(err: RegistryError) -> Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, err.to_string()).into_response()
}

pub async fn get_config(State(state): State<AdminState>) -> Response {
    Json(state.registry.config().await).into_response()
}

pub async fn get_stats(State(state): State<AdminState>) -> Response {
    let stats = state.registry.stats().await;
    if stats.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(stats)).into_response();
    }
    Json(stats).into_response()
}

/// Update the global config.
pub async fn post_config(State(state): State<AdminState>, body: Bytes) -> Response {
    let cfg: Config = match serde_json::from_slice(&body) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(error = %err, "parsing config");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    if let Err(err) = state.registry.update_config(cfg).await {
        tracing::error!(error = %err, "updating config");
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    StatusCode::OK.into_response()
}

pub async fn get_service_stats(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Response {
    match state.registry.service_stats(&service).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn get_service_config(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Response {
    match state.registry.service_config(&service).await {
        Ok(cfg) => Json(cfg).into_response(),
        Err(err) => error_response(err),
    }
}

/// Add or update a service and/or its backends.
pub async fn post_service(
    State(state): State<AdminState>,
    Path(service): Path<String>,
    body: Bytes,
) -> Response {
    let mut svc_cfg: ServiceConfig = match serde_json::from_slice(&body) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(service = %service, error = %err, "parsing service config");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    // don't let someone update the wrong service
    if svc_cfg.name.is_empty() {
        svc_cfg.name = service.clone();
    } else if svc_cfg.name != service {
        return (
            StatusCode::BAD_REQUEST,
            "mismatched service name in API call",
        )
            .into_response();
    }

    let update = Config {
        services: vec![svc_cfg],
        ..Default::default()
    };

    if let Err(err) = state.registry.update_config(update).await {
        tracing::error!(service = %service, error = %err, "updating service");
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }

    Json(state.registry.config().await).into_response()
}

pub async fn delete_service(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Response {
    if let Err(err) = state.registry.remove_service(&service).await {
        tracing::error!(service = %service, error = %err, "removing service");
        return error_response(err);
    }

    state.registry.save_state().await;
    Json(state.registry.config().await).into_response()
}

pub async fn get_backend_stats(
    State(state): State<AdminState>,
    Path((service, backend)): Path<(String, String)>,
) -> Response {
    match state.registry.backend_stats(&service, &backend).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn post_backend(
    State(state): State<AdminState>,
    Path((service, backend)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let mut backend_cfg: BackendConfig = match serde_json::from_slice(&body) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(service = %service, backend = %backend, error = %err, "parsing backend config");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    if backend_cfg.name.is_empty() {
        backend_cfg.name = backend;
    }

    if let Err(err) = state.registry.add_backend(&service, backend_cfg).await {
        return error_response(err);
    }

    state.registry.save_state().await;
    Json(state.registry.config().await).into_response()
}

pub async fn delete_backend(
    State(state): State<AdminState>,
    Path((service, backend)): Path<(String, String)>,
) -> Response {
    if let Err(err) = state.registry.remove_backend(&service, &backend).await {
        return error_response(err);
    }

    state.registry.save_state().await;
    Json(state.registry.config().await).into_response()
}
