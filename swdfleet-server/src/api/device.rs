use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::api::error::ApiError;
use crate::api::{artifact_response, decode_json};
use crate::service::{
    DeviceAuthRequest, DeviceCommandResultRequest, DeviceLocationRequest, DeviceTelemetryRequest,
    RegisterDeviceRequest,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactQuery {
    pub device_id: String,
    pub device_token: String,
}

pub async fn register(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let body: RegisterDeviceRequest = decode_json(request, state.config.max_json_bytes).await?;
    let response = state.service.register_device(body).await?;
    Ok(Json(response).into_response())
}

pub async fn heartbeat(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let body: DeviceAuthRequest = decode_json(request, state.config.max_json_bytes).await?;
    state.service.device_heartbeat(body).await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

pub async fn telemetry(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let body: DeviceTelemetryRequest = decode_json(request, state.config.max_json_bytes).await?;
    state.service.device_telemetry(body).await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

pub async fn location(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let body: DeviceLocationRequest = decode_json(request, state.config.max_json_bytes).await?;
    state.service.device_location(body).await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

/// Devices poll this endpoint; it never blocks and answers `null` when the
/// queue has nothing for them.
pub async fn pull_command(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let body: DeviceAuthRequest = decode_json(request, state.config.max_json_bytes).await?;
    let command = state.service.device_pull_command(body).await?;
    Ok(Json(json!({ "command": command })).into_response())
}

pub async fn command_result(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let mut body: DeviceCommandResultRequest =
        decode_json(request, state.config.max_json_bytes).await?;
    body.command_id = command_id;

    let command = state.service.device_command_result(body).await?;
    Ok(Json(command).into_response())
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<String>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Response, ApiError> {
    let artifact = state
        .service
        .device_get_artifact(&query.device_id, &query.device_token, &artifact_id)
        .await?;
    Ok(artifact_response(artifact))
}
