use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use swdfleet_core::model::{
    Artifact, Command, CommandResult, CommandStatus, CommandType, Device, JsonMap, Location,
    Telemetry, TelemetryRecord,
};

use crate::auth::{AuthError, OperatorAuth};
use crate::config::Config;
use crate::store::{DeviceIdentity, StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid enroll key")]
    InvalidEnrollKey,
    #[error("{0}")]
    MissingField(&'static str),
    #[error("unsupported command type: {0}")]
    UnsupportedCommandType(String),
    #[error("base64_data must be valid base64")]
    InvalidBase64,
    #[error("artifact payload must not be empty")]
    EmptyArtifactPayload,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Business rules over the state store and operator auth. Stateless apart
/// from the injected collaborators.
pub struct Service {
    config: Arc<Config>,
    store: Arc<StateStore>,
    auth: Arc<OperatorAuth>,
    now: fn() -> Timestamp,
}

/// First-registration payload presented by a device.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegisterDeviceRequest {
    pub enroll_key: String,
    pub device_id: String,
    pub hw_uid: String,
    pub modem_imei: String,
    pub sim_iccid: String,
    pub firmware_version: String,
}

/// Issued token plus poll timing for a freshly registered device.
#[derive(Debug, Serialize)]
pub struct RegisterDeviceResponse {
    pub device_token: String,
    pub poll_interval_sec: u32,
    pub heartbeat_interval_sec: u32,
}

/// Device credential pair carried in heartbeat and command-pull bodies.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceAuthRequest {
    pub device_id: String,
    pub device_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceTelemetryRequest {
    pub device_id: String,
    pub device_token: String,
    pub data: Telemetry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceLocationRequest {
    pub device_id: String,
    pub device_token: String,
    pub data: Location,
}

/// Command completion payload. The command id is taken from the request
/// path, overriding anything carried in the body.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceCommandResultRequest {
    pub device_id: String,
    pub device_token: String,
    pub command_id: String,
    pub status: Option<String>,
    pub message: String,
    pub metrics: Option<JsonMap>,
    pub data: Option<JsonMap>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorCommandRequest {
    pub device_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorArtifactRequest {
    pub name: String,
    pub content_type: String,
    pub base64_data: String,
}

impl Service {
    pub fn new(config: Arc<Config>, store: Arc<StateStore>, auth: Arc<OperatorAuth>) -> Self {
        Self {
            config,
            store,
            auth,
            now: Timestamp::now,
        }
    }

    /// Validates the operator password and returns a bearer token with its
    /// expiry.
    pub fn login_operator(&self, password: &str) -> Result<(String, Timestamp), ServiceError> {
        Ok(self.auth.login(password.trim(), (self.now)())?)
    }

    /// Checks an operator bearer token.
    pub fn require_operator(&self, token: &str) -> Result<(), ServiceError> {
        Ok(self.auth.validate(token, (self.now)())?)
    }

    /// Validates the enroll key and registers (or refreshes) the device.
    pub async fn register_device(
        &self,
        req: RegisterDeviceRequest,
    ) -> Result<RegisterDeviceResponse, ServiceError> {
        let enroll_ok = req
            .enroll_key
            .as_bytes()
            .ct_eq(self.config.device_enroll_key.as_bytes());
        if !bool::from(enroll_ok) {
            return Err(ServiceError::InvalidEnrollKey);
        }

        let device_id = req.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(ServiceError::MissingField("device_id is required"));
        }

        let (device, created) = self
            .store
            .register_device(
                DeviceIdentity {
                    device_id,
                    hw_uid: req.hw_uid.trim().to_string(),
                    modem_imei: req.modem_imei.trim().to_string(),
                    sim_iccid: req.sim_iccid.trim().to_string(),
                    firmware_version: req.firmware_version.trim().to_string(),
                },
                (self.now)(),
            )
            .await?;

        tracing::info!(device_id = %device.device_id, created, "device registered");

        Ok(RegisterDeviceResponse {
            device_token: device.device_token,
            poll_interval_sec: 3,
            heartbeat_interval_sec: 10,
        })
    }

    pub async fn device_heartbeat(&self, req: DeviceAuthRequest) -> Result<(), ServiceError> {
        let (device_id, device_token) = require_device_credentials(&req.device_id, &req.device_token)?;
        Ok(self
            .store
            .add_heartbeat(device_id, device_token, (self.now)())
            .await?)
    }

    pub async fn device_telemetry(&self, req: DeviceTelemetryRequest) -> Result<(), ServiceError> {
        let (device_id, device_token) = require_device_credentials(&req.device_id, &req.device_token)?;
        Ok(self
            .store
            .add_telemetry(device_id, device_token, req.data, (self.now)())
            .await?)
    }

    pub async fn device_location(&self, req: DeviceLocationRequest) -> Result<(), ServiceError> {
        let (device_id, device_token) = require_device_credentials(&req.device_id, &req.device_token)?;
        Ok(self
            .store
            .add_location(device_id, device_token, req.data, (self.now)())
            .await?)
    }

    /// Returns the next queued command for the device, if any.
    pub async fn device_pull_command(
        &self,
        req: DeviceAuthRequest,
    ) -> Result<Option<Command>, ServiceError> {
        let (device_id, device_token) = require_device_credentials(&req.device_id, &req.device_token)?;
        Ok(self
            .store
            .pull_next_command(device_id, device_token, (self.now)())
            .await?)
    }

    /// Stores the device-reported outcome for one command. Any status other
    /// than `success` (including none at all) normalizes to `failed`.
    pub async fn device_command_result(
        &self,
        req: DeviceCommandResultRequest,
    ) -> Result<Command, ServiceError> {
        let device_id = req.device_id.trim();
        let device_token = req.device_token.trim();
        let command_id = req.command_id.trim();
        if device_id.is_empty() || device_token.is_empty() || command_id.is_empty() {
            return Err(ServiceError::MissingField(
                "device_id, device_token and command_id are required",
            ));
        }

        let status = match req.status.as_deref() {
            Some("success") => CommandStatus::Success,
            _ => CommandStatus::Failed,
        };

        Ok(self
            .store
            .complete_command(
                device_id,
                device_token,
                command_id,
                CommandResult {
                    status,
                    message: req.message,
                    metrics: req.metrics,
                    data: req.data,
                },
                (self.now)(),
            )
            .await?)
    }

    /// Validates the device token (which also touches liveness), then
    /// returns the artifact.
    pub async fn device_get_artifact(
        &self,
        device_id: &str,
        device_token: &str,
        artifact_id: &str,
    ) -> Result<Artifact, ServiceError> {
        let device_id = device_id.trim();
        let device_token = device_token.trim();
        let artifact_id = artifact_id.trim();
        if device_id.is_empty() || device_token.is_empty() || artifact_id.is_empty() {
            return Err(ServiceError::MissingField(
                "device_id, device_token and artifact_id are required",
            ));
        }

        self.store
            .validate_device_token(device_id, device_token, (self.now)())
            .await?;
        Ok(self.store.get_artifact(artifact_id).await?)
    }

    /// Enqueues a new command after validating its type against the closed
    /// set. An absent payload becomes `{}`.
    pub async fn operator_create_command(
        &self,
        req: OperatorCommandRequest,
        operator: &str,
    ) -> Result<Command, ServiceError> {
        let device_id = req.device_id.trim();
        let type_raw = req.command_type.trim();
        if device_id.is_empty() || type_raw.is_empty() {
            return Err(ServiceError::MissingField("device_id and type are required"));
        }

        let command_type: CommandType = type_raw
            .parse()
            .map_err(|_| ServiceError::UnsupportedCommandType(type_raw.to_string()))?;

        let payload = req.payload.unwrap_or_else(|| serde_json::json!({}));

        Ok(self
            .store
            .add_command(device_id, command_type, payload, operator, (self.now)())
            .await?)
    }

    /// Decodes and stores an uploaded firmware artifact.
    pub async fn operator_upload_artifact(
        &self,
        req: OperatorArtifactRequest,
        operator: &str,
    ) -> Result<Artifact, ServiceError> {
        let name = req.name.trim();
        let content_type = req.content_type.trim();
        let base64_data = req.base64_data.trim();

        if name.is_empty() {
            return Err(ServiceError::MissingField("name is required"));
        }
        if base64_data.is_empty() {
            return Err(ServiceError::MissingField("base64_data is required"));
        }

        let payload = BASE64
            .decode(base64_data.as_bytes())
            .map_err(|_| ServiceError::InvalidBase64)?;
        if payload.is_empty() {
            return Err(ServiceError::EmptyArtifactPayload);
        }

        let content_type = if content_type.is_empty() {
            "application/octet-stream"
        } else {
            content_type
        };

        Ok(self
            .store
            .save_artifact(name, content_type, payload, operator, (self.now)())
            .await?)
    }

    pub async fn operator_get_artifact(&self, artifact_id: &str) -> Result<Artifact, ServiceError> {
        let artifact_id = artifact_id.trim();
        if artifact_id.is_empty() {
            return Err(ServiceError::MissingField("artifact_id is required"));
        }
        Ok(self.store.get_artifact(artifact_id).await?)
    }

    pub async fn operator_list_devices(&self) -> Result<Vec<Device>, ServiceError> {
        Ok(self
            .store
            .list_devices((self.now)(), self.config.device_offline_after)
            .await?)
    }

    pub async fn operator_get_device(&self, device_id: &str) -> Result<Device, ServiceError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(ServiceError::MissingField("device_id is required"));
        }
        Ok(self
            .store
            .get_device(device_id, (self.now)(), self.config.device_offline_after)
            .await?)
    }

    pub async fn operator_list_telemetry(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, ServiceError> {
        Ok(self.store.list_telemetry(device_id.trim(), limit).await?)
    }

    pub async fn operator_list_commands(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, ServiceError> {
        Ok(self.store.list_commands(device_id.trim(), limit).await?)
    }
}

fn require_device_credentials<'a>(
    device_id: &'a str,
    device_token: &'a str,
) -> Result<(&'a str, &'a str), ServiceError> {
    let device_id = device_id.trim();
    let device_token = device_token.trim();
    if device_id.is_empty() || device_token.is_empty() {
        return Err(ServiceError::MissingField(
            "device_id and device_token are required",
        ));
    }
    Ok((device_id, device_token))
}

/// The command types the backend accepts, sorted for deterministic client
/// consumption.
pub fn supported_command_types() -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = CommandType::ALL.iter().map(|t| t.as_str()).collect();
    kinds.sort_unstable();
    kinds
}
