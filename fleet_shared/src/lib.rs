// fleet_shared: types shared by the fleet host, the simulator, and tests

pub mod api_models;
pub mod bus;
pub mod clock;
pub mod config;
pub mod ids;
pub mod protocol;
pub mod status;

pub use bus::{
    AgentEndpoint, AgentTransport, BusPair, ChannelTransport, TransportError, channel_bus,
};
pub use clock::{Clock, ManualClock, SystemClock, saturating_seconds};
pub use ids::{DriverRef, JobId, QueueEntryId, RequestId};
pub use status::{CommandStatus, JobStatus, QueueStatus, StatusCodeError};
