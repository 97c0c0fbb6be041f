use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jiff::Timestamp;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::api::error::ApiError;
use crate::api::security::request_ip;
use crate::api::{artifact_response, bearer_token, decode_json, parse_limit_or_default, peer_addr};
use crate::auth::AuthError;
use crate::service::{
    OperatorArtifactRequest, OperatorCommandRequest, ServiceError, supported_command_types,
};

/// The single shared operator principal recorded as `created_by`.
const OPERATOR: &str = "operator";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub limit: Option<String>,
}

/// Gate for the operator sub-router: a valid bearer session is required.
pub async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(ApiError::MissingBearer)?;
    state.service.require_operator(&token)?;
    Ok(next.run(request).await)
}

pub async fn login(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let now = Timestamp::now();
    let ip = request_ip(
        request.headers(),
        peer_addr(&request),
        state.config.trust_proxy_headers,
    );

    if let Some(retry_after) = state.login_guard.allow(&ip, now) {
        tracing::warn!(%ip, "login attempt blocked");
        return Err(ApiError::LoginRateExceeded {
            retry_after_secs: retry_after.as_secs().max(0) as u64,
        });
    }

    let body: LoginRequest = decode_json(request, state.config.max_json_bytes).await?;

    match state.service.login_operator(&body.password) {
        Ok((token, expires_at)) => {
            state.login_guard.on_success(&ip);
            Ok(Json(json!({ "token": token, "expires_at": expires_at })).into_response())
        }
        Err(err) => {
            if matches!(err, ServiceError::Auth(AuthError::InvalidPassword)) {
                state.login_guard.on_failure(&ip, now);
            }
            Err(err.into())
        }
    }
}

pub async fn capabilities() -> Json<serde_json::Value> {
    Json(json!({ "supported_commands": supported_command_types() }))
}

pub async fn list_devices(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.service.operator_list_devices().await?;
    Ok(Json(json!({ "items": devices })))
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Response, ApiError> {
    let device = state.service.operator_get_device(&device_id).await?;
    Ok(Json(device).into_response())
}

pub async fn list_telemetry(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = parse_limit_or_default(query.limit.as_deref(), 100);
    let items = state.service.operator_list_telemetry(&device_id, limit).await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn list_commands(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = parse_limit_or_default(query.limit.as_deref(), 100);
    let items = state.service.operator_list_commands(&device_id, limit).await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn create_command(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let body: OperatorCommandRequest = decode_json(request, state.config.max_json_bytes).await?;
    let command = state.service.operator_create_command(body, OPERATOR).await?;
    Ok((StatusCode::CREATED, Json(command)).into_response())
}

pub async fn upload_artifact(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let body: OperatorArtifactRequest =
        decode_json(request, state.config.max_artifact_bytes).await?;
    let artifact = state.service.operator_upload_artifact(body, OPERATOR).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "artifact_id": artifact.artifact_id,
            "name": artifact.name,
            "content_type": artifact.content_type,
            "size": artifact.payload.len(),
            "payload_sha256": artifact.payload_sha256,
        })),
    )
        .into_response())
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state.service.operator_get_artifact(&artifact_id).await?;
    Ok(artifact_response(artifact))
}
