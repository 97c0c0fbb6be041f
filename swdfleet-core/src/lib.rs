pub mod model;
pub mod token;

pub use model::{
    Artifact, Command, CommandResult, CommandStatus, CommandType, Device, DeviceStatus, JsonMap,
    Location, PersistedState, Telemetry, TelemetryRecord,
};
pub use token::random_token;
