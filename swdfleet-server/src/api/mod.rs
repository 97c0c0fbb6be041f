pub mod device;
pub mod error;
pub mod operator;
pub mod security;

use std::net::SocketAddr;

use axum::Router;
use axum::extract::Request;
use axum::http::header::{self, HeaderMap};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::de::DeserializeOwned;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use swdfleet_core::model::Artifact;

use crate::AppState;
use crate::api::error::ApiError;
use crate::api::security::ClientAddr;

/// Wires API routes, static assets and the security middleware stack.
/// Middleware runs outermost-first: security headers, per-IP rate limit
/// (API surface only), access log, then route dispatch.
pub fn router(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/operator/capabilities", get(operator::capabilities))
        .route("/devices", get(operator::list_devices))
        .route("/devices/{device_id}", get(operator::get_device))
        .route("/devices/{device_id}/telemetry", get(operator::list_telemetry))
        .route("/devices/{device_id}/commands", get(operator::list_commands))
        .route("/commands", post(operator::create_command))
        .route("/artifacts", post(operator::upload_artifact))
        .route("/artifacts/{artifact_id}", get(operator::download_artifact))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            operator::require_operator,
        ));

    let device_routes = Router::new()
        .route("/device/register", post(device::register))
        .route("/device/heartbeat", post(device::heartbeat))
        .route("/device/telemetry", post(device::telemetry))
        .route("/device/location", post(device::location))
        .route("/device/commands/pull", post(device::pull_command))
        .route("/device/commands/{command_id}/result", post(device::command_result))
        .route("/device/artifacts/{artifact_id}", get(device::download_artifact));

    let api = Router::new()
        .route("/operator/login", post(operator::login))
        .merge(operator_routes)
        .merge(device_routes);

    Router::new()
        .nest("/api/v1", api)
        .fallback_service(ServeDir::new(&state.config.static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state.clone(), security::api_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), security::security_headers))
        .with_state(state)
}

/// Buffers and decodes a JSON body. Bodies over `max_bytes` are rejected, as
/// are unknown fields and trailing content.
pub(crate) async fn decode_json<T: DeserializeOwned>(
    request: Request,
    max_bytes: usize,
) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(request.into_body(), max_bytes)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::InvalidJson(err.to_string()))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token.to_string()) }
}

pub(crate) fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request.extensions().get::<ClientAddr>().map(|addr| addr.0)
}

/// Lenient `?limit=` parsing: absent, garbage or non-positive values fall
/// back to the default.
pub(crate) fn parse_limit_or_default(raw: Option<&str>, default: usize) -> usize {
    match raw {
        None | Some("") => default,
        Some(value) => match value.parse::<i64>() {
            Ok(parsed) if parsed > 0 => parsed as usize,
            _ => default,
        },
    }
}

/// Streams stored artifact bytes with their content type and an attachment
/// disposition.
pub(crate) fn artifact_response(artifact: Artifact) -> Response {
    let filename = artifact.name.replace(['"', '\r', '\n'], "_");
    (
        [
            (header::CONTENT_TYPE, artifact.content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        artifact.payload,
    )
        .into_response()
}
