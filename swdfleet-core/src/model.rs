use std::collections::BTreeMap;
use std::str::FromStr;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Free-form string-keyed JSON object used for telemetry extras and command
/// result metrics/data.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Runtime connectivity state derived from `last_seen_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Lifecycle of an operator command: `Queued` -> `Dispatched` -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Dispatched,
    Success,
    Failed,
}

/// The closed set of SWD operations a device can perform on its target MCU.
/// The payload of each is opaque to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SwdConnect,
    SwdReadMemory,
    SwdWriteMemory,
    SwdErase,
    SwdProgram,
    SwdVerify,
    SwdCopyFirmware,
    SwdReset,
}

impl CommandType {
    pub const ALL: [CommandType; 8] = [
        CommandType::SwdConnect,
        CommandType::SwdReadMemory,
        CommandType::SwdWriteMemory,
        CommandType::SwdErase,
        CommandType::SwdProgram,
        CommandType::SwdVerify,
        CommandType::SwdCopyFirmware,
        CommandType::SwdReset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::SwdConnect => "swd_connect",
            CommandType::SwdReadMemory => "swd_read_memory",
            CommandType::SwdWriteMemory => "swd_write_memory",
            CommandType::SwdErase => "swd_erase",
            CommandType::SwdProgram => "swd_program",
            CommandType::SwdVerify => "swd_verify",
            CommandType::SwdCopyFirmware => "swd_copy_firmware",
            CommandType::SwdReset => "swd_reset",
        }
    }
}

impl FromStr for CommandType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

/// Device metadata and last known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub hw_uid: String,
    pub modem_imei: String,
    pub sim_iccid: String,
    pub firmware_version: String,
    pub device_token: String,
    pub registered_at: Timestamp,
    pub last_seen_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_telemetry_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_telemetry: Option<Telemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<Location>,
    pub status: DeviceStatus,
}

/// Periodic device metrics. Fields a device does not report decode to their
/// zero values; unknown fields are rejected at the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Telemetry {
    pub battery_mv: i64,
    pub supply_mv: i64,
    pub temperature_c: f64,
    pub rssi_dbm: i64,
    pub network_state: String,
    pub uptime_sec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<JsonMap>,
}

/// Last known coordinates. Only the latest sample is retained per device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub accuracy_m: f64,
    pub source: String,
}

/// Immutable point in a device's telemetry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: Timestamp,
    pub data: Telemetry,
}

/// Execution output reported by a device for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,
}

/// A queued SWD action for one device. Commands stay in the queue after
/// completion as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub created_by: String,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
}

/// Content-addressed binary payload for program/copy operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub name: String,
    pub content_type: String,
    pub created_by: String,
    pub created_at: Timestamp,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub payload_sha256: String,
}

/// Whole server state as serialized into the snapshot file. `BTreeMap` keeps
/// snapshots deterministic and device listings sorted by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub telemetry_by_id: BTreeMap<String, Vec<TelemetryRecord>>,
    #[serde(default)]
    pub commands_by_id: BTreeMap<String, Vec<Command>>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
}

/// Byte payloads travel as base64 strings in JSON.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_round_trip() {
        for kind in CommandType::ALL {
            assert_eq!(kind.as_str().parse::<CommandType>(), Ok(kind));
        }
        assert!("swd_unknown".parse::<CommandType>().is_err());
    }

    #[test]
    fn command_type_serializes_snake_case() {
        let json = serde_json::to_string(&CommandType::SwdCopyFirmware).unwrap();
        assert_eq!(json, "\"swd_copy_firmware\"");
    }

    #[test]
    fn artifact_payload_is_base64_in_json() {
        let artifact = Artifact {
            artifact_id: "art_test".to_string(),
            name: "fw.bin".to_string(),
            content_type: "application/octet-stream".to_string(),
            created_by: "operator".to_string(),
            created_at: Timestamp::from_second(100).unwrap(),
            payload: vec![0x00, 0xff, 0x10],
            payload_sha256: String::new(),
        };

        let value: serde_json::Value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["payload"], serde_json::json!("AP8Q"));

        let back: Artifact = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload, artifact.payload);
    }

    #[test]
    fn persisted_state_tolerates_missing_sections() {
        let state: PersistedState = serde_json::from_str("{\"devices\": {}}").unwrap();
        assert!(state.artifacts.is_empty());
        assert!(state.commands_by_id.is_empty());
    }
}
