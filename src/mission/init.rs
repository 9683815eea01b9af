use serde::{Deserialize, Serialize};

use super::document::DocumentError;
use super::spec::MissionSpec;

pub const DEFAULT_CLIENT_MISSION_CONTROL_PORT: u16 = 10000;

/// Where the shared simulation server of a multi-agent mission runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLocation {
    pub address: String,
    pub port: u16,
}

/// Addresses and ports both ends of a mission use to reach each other.
/// Agent ports start at 0 and are filled in once the listeners are bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAgentConnection {
    pub client_address: String,
    pub client_mission_control_port: u16,
    #[serde(default)]
    pub client_commands_port: u16,
    pub agent_address: String,
    #[serde(default)]
    pub agent_mission_control_port: u16,
    #[serde(default)]
    pub agent_video_port: u16,
    #[serde(default)]
    pub agent_observations_port: u16,
    #[serde(default)]
    pub agent_rewards_port: u16,
}

/// Negotiation record sent to candidate clients and replaced by the copy the
/// accepting client echoes back once the mission starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionInit {
    pub version: String,
    pub experiment_id: String,
    pub role: usize,
    pub mission: MissionSpec,
    pub connection: ClientAgentConnection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerLocation>,
}

impl MissionInit {
    pub fn new(
        mission: MissionSpec,
        experiment_id: impl Into<String>,
        role: usize,
        version: impl Into<String>,
        agent_address: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            experiment_id: experiment_id.into(),
            role,
            mission,
            connection: ClientAgentConnection {
                client_address: String::new(),
                client_mission_control_port: DEFAULT_CLIENT_MISSION_CONTROL_PORT,
                client_commands_port: 0,
                agent_address: agent_address.into(),
                agent_mission_control_port: 0,
                agent_video_port: 0,
                agent_observations_port: 0,
                agent_rewards_port: 0,
            },
            server: None,
        }
    }

    pub fn set_client(&mut self, address: &str, port: u16) {
        self.connection.client_address = address.to_string();
        self.connection.client_mission_control_port = port;
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    /// Serializes as a single-line `{"MissionInit": {...}}` document.
    pub fn to_document(&self) -> Result<String, DocumentError> {
        let mut root = serde_json::Map::new();
        root.insert(super::document::MISSION_INIT_ROOT.to_string(), serde_json::to_value(self)?);
        Ok(serde_json::Value::Object(root).to_string())
    }

    pub fn to_pretty_document(&self) -> Result<String, DocumentError> {
        let mut root = serde_json::Map::new();
        root.insert(super::document::MISSION_INIT_ROOT.to_string(), serde_json::to_value(self)?);
        Ok(serde_json::to_string_pretty(&serde_json::Value::Object(root))?)
    }
}
