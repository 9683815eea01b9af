pub mod commands;
pub mod compat;
pub mod config;
pub mod discovery;
pub mod host;
pub mod listeners;
pub mod mission;
pub mod runtime;
pub mod world_state;

pub use config::HostConfig;
pub use discovery::{ClientInfo, ClientPool};
pub use host::{AgentHost, HostError, MissionPhase};
pub use mission::{MissionRecordSpec, MissionSpec};
pub use world_state::{ObservationsPolicy, RewardsPolicy, VideoPolicy, WorldState};

/// Negotiation protocol version spoken with clients.
pub const PROTOCOL_VERSION: &str = "0.37.0";
