use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use jiff::{SignedDuration, Timestamp};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use swdfleet_core::model::{
    Artifact, Command, CommandResult, CommandStatus, CommandType, Device, DeviceStatus, Location,
    PersistedState, Telemetry, TelemetryRecord,
};
use swdfleet_core::random_token;

/// Telemetry records retained per device; the oldest are dropped past this.
pub const MAX_TELEMETRY_HISTORY: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("fleet limit reached")]
    FleetLimitReached,
    #[error("device id already exists with different identity")]
    DeviceExistsWithOtherIdentity,
    #[error("device not found")]
    DeviceNotFound,
    #[error("invalid device token")]
    InvalidDeviceToken,
    #[error("command not found")]
    CommandNotFound,
    #[error("artifact not found")]
    ArtifactNotFound,
    #[error("snapshot io: {0}")]
    Snapshot(#[source] std::io::Error),
    #[error("encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode snapshot: {0}")]
    Corrupt(#[source] serde_json::Error),
}

/// Identity fields a device presents at registration.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub hw_uid: String,
    pub modem_imei: String,
    pub sim_iccid: String,
    pub firmware_version: String,
}

/// Authoritative owner of all runtime state, persisted as a JSON snapshot.
///
/// One coarse reader/writer lock guards the whole state. Every mutating
/// operation takes the write lock, applies the change and writes a full
/// snapshot before returning, so a success response implies the mutation is
/// on disk. Callers only ever receive clones.
#[derive(Debug)]
pub struct StateStore {
    fleet_limit: usize,
    data_file: PathBuf,
    state: RwLock<PersistedState>,
}

impl StateStore {
    /// Opens the store, loading a prior snapshot when one exists. A missing
    /// file yields an empty state; an unreadable or malformed file is a
    /// startup error.
    pub async fn load(
        data_file: impl Into<PathBuf>,
        fleet_limit: usize,
    ) -> Result<Self, StoreError> {
        let data_file = data_file.into();
        let state = match tokio::fs::read(&data_file).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(StoreError::Corrupt)?,
            Err(err) if err.kind() == ErrorKind::NotFound => PersistedState::default(),
            Err(err) => return Err(StoreError::Snapshot(err)),
        };

        Ok(Self {
            fleet_limit,
            data_file,
            state: RwLock::new(state),
        })
    }

    /// Serializes the full state to `<data_file>.tmp` and atomically renames
    /// it over the data file. Called with the write lock held.
    async fn persist(&self, state: &PersistedState) -> Result<(), StoreError> {
        if let Some(parent) = self.data_file.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StoreError::Snapshot)?;
        }

        let raw = serde_json::to_vec_pretty(state).map_err(StoreError::Encode)?;

        let mut temp_file = self.data_file.clone().into_os_string();
        temp_file.push(".tmp");
        let temp_file = PathBuf::from(temp_file);

        tokio::fs::write(&temp_file, &raw)
            .await
            .map_err(StoreError::Snapshot)?;
        tokio::fs::rename(&temp_file, &self.data_file)
            .await
            .map_err(StoreError::Snapshot)?;
        Ok(())
    }

    /// Creates or refreshes a device record. Returns the device clone and
    /// whether it was newly created.
    pub async fn register_device(
        &self,
        identity: DeviceIdentity,
        now: Timestamp,
    ) -> Result<(Device, bool), StoreError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.devices.get_mut(&identity.device_id) {
            if identity_conflict(&existing.hw_uid, &identity.hw_uid)
                || identity_conflict(&existing.modem_imei, &identity.modem_imei)
            {
                return Err(StoreError::DeviceExistsWithOtherIdentity);
            }

            fill_if_empty(&mut existing.hw_uid, identity.hw_uid);
            fill_if_empty(&mut existing.modem_imei, identity.modem_imei);
            fill_if_empty(&mut existing.sim_iccid, identity.sim_iccid);
            if !identity.firmware_version.is_empty() {
                existing.firmware_version = identity.firmware_version;
            }
            existing.last_seen_at = now;
            existing.last_heartbeat_at = now;
            existing.status = DeviceStatus::Online;

            let device = existing.clone();
            self.persist(&state).await?;
            return Ok((device, false));
        }

        if state.devices.len() >= self.fleet_limit {
            return Err(StoreError::FleetLimitReached);
        }

        let device = Device {
            device_id: identity.device_id.clone(),
            hw_uid: identity.hw_uid,
            modem_imei: identity.modem_imei,
            sim_iccid: identity.sim_iccid,
            firmware_version: identity.firmware_version,
            device_token: random_token("dev", 16),
            registered_at: now,
            last_seen_at: now,
            last_heartbeat_at: now,
            last_telemetry_at: None,
            last_location_at: None,
            last_telemetry: None,
            last_location: None,
            status: DeviceStatus::Online,
        };

        state.devices.insert(identity.device_id, device.clone());
        self.persist(&state).await?;
        Ok((device, true))
    }

    /// Checks that the device exists and the token matches, bumping liveness
    /// on success.
    pub async fn validate_device_token(
        &self,
        device_id: &str,
        device_token: &str,
        now: Timestamp,
    ) -> Result<Device, StoreError> {
        let mut state = self.state.write().await;

        let device = require_device(&mut state.devices, device_id, device_token)?;
        device.last_seen_at = now;
        device.status = DeviceStatus::Online;
        let device = device.clone();

        self.persist(&state).await?;
        Ok(device)
    }

    pub async fn add_heartbeat(
        &self,
        device_id: &str,
        device_token: &str,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        let device = require_device(&mut state.devices, device_id, device_token)?;
        device.last_seen_at = now;
        device.last_heartbeat_at = now;
        device.status = DeviceStatus::Online;

        self.persist(&state).await
    }

    /// Appends one telemetry record, trims the ring to
    /// [`MAX_TELEMETRY_HISTORY`], and mirrors the sample into the device.
    pub async fn add_telemetry(
        &self,
        device_id: &str,
        device_token: &str,
        data: Telemetry,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let state = &mut *state;

        let device = require_device(&mut state.devices, device_id, device_token)?;

        let ring = state.telemetry_by_id.entry(device_id.to_string()).or_default();
        ring.push(TelemetryRecord {
            device_id: device_id.to_string(),
            timestamp: now,
            data: data.clone(),
        });
        if ring.len() > MAX_TELEMETRY_HISTORY {
            let excess = ring.len() - MAX_TELEMETRY_HISTORY;
            ring.drain(..excess);
        }

        device.last_telemetry = Some(data);
        device.last_telemetry_at = Some(now);
        device.last_seen_at = now;
        device.status = DeviceStatus::Online;

        self.persist(state).await
    }

    /// Overwrites the latest coordinates for a device.
    pub async fn add_location(
        &self,
        device_id: &str,
        device_token: &str,
        location: Location,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        let device = require_device(&mut state.devices, device_id, device_token)?;
        device.last_location = Some(location);
        device.last_location_at = Some(now);
        device.last_seen_at = now;
        device.status = DeviceStatus::Online;

        self.persist(&state).await
    }

    /// Returns all devices sorted by id ascending, with online/offline
    /// status refreshed against `offline_after`.
    pub async fn list_devices(
        &self,
        now: Timestamp,
        offline_after: SignedDuration,
    ) -> Result<Vec<Device>, StoreError> {
        let mut state = self.state.write().await;

        for device in state.devices.values_mut() {
            device.status = derive_status(device.last_seen_at, now, offline_after);
        }
        let out: Vec<Device> = state.devices.values().cloned().collect();

        self.persist(&state).await?;
        Ok(out)
    }

    /// Returns one device with its status refreshed.
    pub async fn get_device(
        &self,
        device_id: &str,
        now: Timestamp,
        offline_after: SignedDuration,
    ) -> Result<Device, StoreError> {
        let mut state = self.state.write().await;

        let device = state
            .devices
            .get_mut(device_id)
            .ok_or(StoreError::DeviceNotFound)?;
        device.status = derive_status(device.last_seen_at, now, offline_after);
        let device = device.clone();

        self.persist(&state).await?;
        Ok(device)
    }

    /// Returns the most recent telemetry records; `limit == 0` means all.
    pub async fn list_telemetry(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let state = self.state.read().await;

        if !state.devices.contains_key(device_id) {
            return Err(StoreError::DeviceNotFound);
        }

        let items = state
            .telemetry_by_id
            .get(device_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(tail(items, limit).to_vec())
    }

    /// Appends a new command to the device queue with status `queued`.
    pub async fn add_command(
        &self,
        device_id: &str,
        command_type: CommandType,
        payload: serde_json::Value,
        created_by: &str,
        now: Timestamp,
    ) -> Result<Command, StoreError> {
        let mut state = self.state.write().await;

        if !state.devices.contains_key(device_id) {
            return Err(StoreError::DeviceNotFound);
        }

        let command = Command {
            command_id: random_token("cmd", 12),
            device_id: device_id.to_string(),
            command_type,
            payload,
            created_by: created_by.to_string(),
            created_at: now,
            dispatched_at: None,
            completed_at: None,
            status: CommandStatus::Queued,
            result: None,
        };

        state
            .commands_by_id
            .entry(device_id.to_string())
            .or_default()
            .push(command.clone());

        self.persist(&state).await?;
        Ok(command)
    }

    /// Returns command history, most recent last; `limit == 0` means all.
    pub async fn list_commands(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let state = self.state.read().await;

        if !state.devices.contains_key(device_id) {
            return Err(StoreError::DeviceNotFound);
        }

        let items = state
            .commands_by_id
            .get(device_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(tail(items, limit).to_vec())
    }

    /// Dispatches the first queued command for the device, in insertion
    /// order. Returns `None` when the queue has nothing queued; device
    /// liveness is updated either way.
    pub async fn pull_next_command(
        &self,
        device_id: &str,
        device_token: &str,
        now: Timestamp,
    ) -> Result<Option<Command>, StoreError> {
        let mut state = self.state.write().await;
        let state = &mut *state;

        let device = require_device(&mut state.devices, device_id, device_token)?;
        device.last_seen_at = now;
        device.status = DeviceStatus::Online;

        let mut pulled = None;
        if let Some(queue) = state.commands_by_id.get_mut(device_id)
            && let Some(item) = queue
                .iter_mut()
                .find(|command| command.status == CommandStatus::Queued)
        {
            item.status = CommandStatus::Dispatched;
            item.dispatched_at = Some(now);
            pulled = Some(item.clone());
        }

        self.persist(state).await?;
        Ok(pulled)
    }

    /// Stores the final result for one dispatched command. The command moves
    /// to `success` only when the result status says so; anything else is
    /// `failed`.
    pub async fn complete_command(
        &self,
        device_id: &str,
        device_token: &str,
        command_id: &str,
        result: CommandResult,
        now: Timestamp,
    ) -> Result<Command, StoreError> {
        let mut state = self.state.write().await;
        let state = &mut *state;

        let device = require_device(&mut state.devices, device_id, device_token)?;

        let Some(item) = state
            .commands_by_id
            .get_mut(device_id)
            .and_then(|queue| queue.iter_mut().find(|c| c.command_id == command_id))
        else {
            return Err(StoreError::CommandNotFound);
        };

        item.completed_at = Some(now);
        item.status = if result.status == CommandStatus::Success {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        };
        item.result = Some(result);
        let command = item.clone();

        device.last_seen_at = now;
        device.status = DeviceStatus::Online;

        self.persist(state).await?;
        Ok(command)
    }

    /// Stores a binary payload under its content address. Identical bytes
    /// deduplicate to the existing record; a same-id different-bytes case
    /// would be an integrity bug, never a silent overwrite.
    pub async fn save_artifact(
        &self,
        name: &str,
        content_type: &str,
        payload: Vec<u8>,
        created_by: &str,
        now: Timestamp,
    ) -> Result<Artifact, StoreError> {
        let mut state = self.state.write().await;

        let digest_hex = hex::encode(Sha256::digest(&payload));
        let artifact_id = format!("art_{}", &digest_hex[..24]);

        if let Some(existing) = state.artifacts.get(&artifact_id) {
            return Ok(existing.clone());
        }

        let artifact = Artifact {
            artifact_id: artifact_id.clone(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            created_by: created_by.to_string(),
            created_at: now,
            payload,
            payload_sha256: digest_hex,
        };

        state.artifacts.insert(artifact_id, artifact.clone());
        self.persist(&state).await?;
        Ok(artifact)
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Result<Artifact, StoreError> {
        let state = self.state.read().await;
        state
            .artifacts
            .get(artifact_id)
            .cloned()
            .ok_or(StoreError::ArtifactNotFound)
    }

    pub async fn device_count(&self) -> usize {
        self.state.read().await.devices.len()
    }
}

fn derive_status(last_seen: Timestamp, now: Timestamp, offline_after: SignedDuration) -> DeviceStatus {
    if now.duration_since(last_seen) > offline_after {
        DeviceStatus::Offline
    } else {
        DeviceStatus::Online
    }
}

fn require_device<'a>(
    devices: &'a mut BTreeMap<String, Device>,
    device_id: &str,
    device_token: &str,
) -> Result<&'a mut Device, StoreError> {
    let device = devices.get_mut(device_id).ok_or(StoreError::DeviceNotFound)?;
    if !bool::from(device.device_token.as_bytes().ct_eq(device_token.as_bytes())) {
        return Err(StoreError::InvalidDeviceToken);
    }
    Ok(device)
}

fn identity_conflict(existing: &str, incoming: &str) -> bool {
    !existing.is_empty() && !incoming.is_empty() && existing != incoming
}

fn fill_if_empty(slot: &mut String, value: String) {
    if slot.is_empty() && !value.is_empty() {
        *slot = value;
    }
}

fn tail<T>(items: &[T], limit: usize) -> &[T] {
    if limit == 0 || limit >= items.len() {
        items
    } else {
        &items[items.len() - limit..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(device_id: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: device_id.to_string(),
            hw_uid: format!("uid-{device_id}"),
            modem_imei: format!("imei-{device_id}"),
            sim_iccid: format!("iccid-{device_id}"),
            firmware_version: "r1".to_string(),
        }
    }

    fn ts(second: i64) -> Timestamp {
        Timestamp::from_second(second).unwrap()
    }

    async fn store_in(dir: &tempfile::TempDir, fleet_limit: usize) -> StateStore {
        StateStore::load(dir.path().join("state.json"), fleet_limit)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_respects_fleet_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 1).await;

        let (_, created) = store.register_device(identity("dev-1"), ts(100)).await.unwrap();
        assert!(created);

        let err = store
            .register_device(identity("dev-2"), ts(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FleetLimitReached));
        assert_eq!(store.device_count().await, 1);
    }

    #[tokio::test]
    async fn reregister_keeps_token_and_backfills_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        let mut first = identity("dev-1");
        first.sim_iccid = String::new();
        let (device, created) = store.register_device(first, ts(100)).await.unwrap();
        assert!(created);

        let mut again = identity("dev-1");
        again.firmware_version = "r2".to_string();
        let (updated, created) = store.register_device(again, ts(200)).await.unwrap();
        assert!(!created);
        assert_eq!(updated.device_token, device.device_token);
        assert_eq!(updated.sim_iccid, "iccid-dev-1");
        assert_eq!(updated.firmware_version, "r2");
        assert_eq!(updated.last_seen_at, ts(200));
    }

    #[tokio::test]
    async fn reregister_with_conflicting_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        store.register_device(identity("dev-1"), ts(100)).await.unwrap();

        let mut conflicting = identity("dev-1");
        conflicting.hw_uid = "other-uid".to_string();
        let err = store
            .register_device(conflicting, ts(200))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DeviceExistsWithOtherIdentity));

        let stored = store
            .get_device("dev-1", ts(200), SignedDuration::from_secs(90))
            .await
            .unwrap();
        assert_eq!(stored.hw_uid, "uid-dev-1");
    }

    #[tokio::test]
    async fn command_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        let (device, _) = store.register_device(identity("dev-1"), ts(200)).await.unwrap();

        let command = store
            .add_command(
                "dev-1",
                CommandType::SwdReset,
                serde_json::json!({"hard": true}),
                "operator",
                ts(200),
            )
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Queued);

        let pulled = store
            .pull_next_command("dev-1", &device.device_token, ts(201))
            .await
            .unwrap()
            .expect("a command should be queued");
        assert_eq!(pulled.command_id, command.command_id);
        assert_eq!(pulled.status, CommandStatus::Dispatched);
        assert_eq!(pulled.dispatched_at, Some(ts(201)));

        // Nothing else queued.
        assert!(
            store
                .pull_next_command("dev-1", &device.device_token, ts(202))
                .await
                .unwrap()
                .is_none()
        );

        let done = store
            .complete_command(
                "dev-1",
                &device.device_token,
                &command.command_id,
                CommandResult {
                    status: CommandStatus::Success,
                    message: "ok".to_string(),
                    metrics: None,
                    data: None,
                },
                ts(202),
            )
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Success);
        assert_eq!(done.completed_at, Some(ts(202)));
        assert_eq!(done.result.as_ref().unwrap().message, "ok");
    }

    #[tokio::test]
    async fn complete_unknown_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        let (device, _) = store.register_device(identity("dev-1"), ts(200)).await.unwrap();
        let err = store
            .complete_command(
                "dev-1",
                &device.device_token,
                "cmd_missing",
                CommandResult {
                    status: CommandStatus::Failed,
                    message: String::new(),
                    metrics: None,
                    data: None,
                },
                ts(201),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CommandNotFound));
    }

    #[tokio::test]
    async fn commands_dispatch_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        let (device, _) = store.register_device(identity("dev-1"), ts(300)).await.unwrap();
        let first = store
            .add_command("dev-1", CommandType::SwdConnect, serde_json::json!({}), "operator", ts(300))
            .await
            .unwrap();
        let second = store
            .add_command("dev-1", CommandType::SwdErase, serde_json::json!({}), "operator", ts(301))
            .await
            .unwrap();

        let pulled = store
            .pull_next_command("dev-1", &device.device_token, ts(302))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled.command_id, first.command_id);

        let pulled = store
            .pull_next_command("dev-1", &device.device_token, ts(303))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled.command_id, second.command_id);
    }

    #[tokio::test]
    async fn concurrent_enqueues_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(&dir, 10).await);

        store.register_device(identity("dev-1"), ts(0)).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .add_command(
                        "dev-1",
                        CommandType::SwdReadMemory,
                        serde_json::json!({"offset": i}),
                        "operator",
                        ts(i),
                    )
                    .await
                    .unwrap()
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        let commands = store.list_commands("dev-1", 0).await.unwrap();
        assert_eq!(commands.len(), 20);

        let mut ids: Vec<&str> = commands.iter().map(|c| c.command_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert!(commands.iter().all(|c| c.status == CommandStatus::Queued));
    }

    #[tokio::test]
    async fn telemetry_ring_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        let (device, _) = store.register_device(identity("dev-1"), ts(0)).await.unwrap();

        for i in 0..(MAX_TELEMETRY_HISTORY as i64 + 10) {
            let sample = Telemetry {
                battery_mv: 3600 + i,
                ..Telemetry::default()
            };
            store
                .add_telemetry("dev-1", &device.device_token, sample, ts(i))
                .await
                .unwrap();
        }

        let history = store.list_telemetry("dev-1", 0).await.unwrap();
        assert_eq!(history.len(), MAX_TELEMETRY_HISTORY);
        // The ten oldest samples were dropped.
        assert_eq!(history[0].data.battery_mv, 3610);

        let last_two = store.list_telemetry("dev-1", 2).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(
            last_two[1].data.battery_mv,
            3600 + MAX_TELEMETRY_HISTORY as i64 + 9
        );
    }

    #[tokio::test]
    async fn status_derived_from_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;
        let offline_after = SignedDuration::from_secs(90);

        store.register_device(identity("dev-1"), ts(1000)).await.unwrap();

        let device = store.get_device("dev-1", ts(1090), offline_after).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);

        let device = store.get_device("dev-1", ts(1091), offline_after).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);

        let listed = store.list_devices(ts(1091), offline_after).await.unwrap();
        assert_eq!(listed[0].status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn devices_listed_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        for id in ["dev-c", "dev-a", "dev-b"] {
            store.register_device(identity(id), ts(0)).await.unwrap();
        }

        let listed = store
            .list_devices(ts(1), SignedDuration::from_secs(90))
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, ["dev-a", "dev-b", "dev-c"]);
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        store.register_device(identity("dev-1"), ts(0)).await.unwrap();
        let err = store
            .add_heartbeat("dev-1", "dev_wrong", ts(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDeviceToken));

        let err = store.add_heartbeat("dev-2", "dev_any", ts(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DeviceNotFound));
    }

    #[tokio::test]
    async fn artifacts_deduplicate_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, 10).await;

        let first = store
            .save_artifact("fw.bin", "application/octet-stream", vec![0x00], "operator", ts(10))
            .await
            .unwrap();

        let expected_digest = hex::encode(Sha256::digest([0x00]));
        assert_eq!(first.artifact_id, format!("art_{}", &expected_digest[..24]));
        assert_eq!(first.payload_sha256, expected_digest);

        let second = store
            .save_artifact("other-name.bin", "text/plain", vec![0x00], "operator", ts(20))
            .await
            .unwrap();
        assert_eq!(second.artifact_id, first.artifact_id);
        // The original record wins; the second upload is a no-op.
        assert_eq!(second.name, "fw.bin");

        let fetched = store.get_artifact(&first.artifact_id).await.unwrap();
        assert_eq!(fetched.payload, vec![0x00]);

        assert!(matches!(
            store.get_artifact("art_missing").await.unwrap_err(),
            StoreError::ArtifactNotFound
        ));
    }

    #[tokio::test]
    async fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let device_token;
        let command_id;
        {
            let store = StateStore::load(&path, 10).await.unwrap();
            let (device, _) = store.register_device(identity("dev-1"), ts(300)).await.unwrap();
            device_token = device.device_token;

            let command = store
                .add_command(
                    "dev-1",
                    CommandType::SwdProgram,
                    serde_json::json!({"addr": "0x08000000"}),
                    "operator",
                    ts(301),
                )
                .await
                .unwrap();
            command_id = command.command_id;

            store
                .add_telemetry("dev-1", &device_token, Telemetry::default(), ts(302))
                .await
                .unwrap();
            store
                .save_artifact("fw.bin", "application/octet-stream", vec![1, 2, 3], "operator", ts(303))
                .await
                .unwrap();
        }

        let reloaded = StateStore::load(&path, 10).await.unwrap();
        assert_eq!(reloaded.device_count().await, 1);

        let device = reloaded
            .get_device("dev-1", ts(304), SignedDuration::from_secs(90))
            .await
            .unwrap();
        assert_eq!(device.device_token, device_token);

        let commands = reloaded.list_commands("dev-1", 0).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command_id, command_id);
        assert_eq!(commands[0].status, CommandStatus::Queued);

        assert_eq!(reloaded.list_telemetry("dev-1", 0).await.unwrap().len(), 1);

        let artifacts_digest = hex::encode(Sha256::digest([1, 2, 3]));
        let artifact = reloaded
            .get_artifact(&format!("art_{}", &artifacts_digest[..24]))
            .await
            .unwrap();
        assert_eq!(artifact.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(matches!(
            StateStore::load(&path, 10).await.unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }
}
