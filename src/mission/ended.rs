use std::fmt;

use serde::{Deserialize, Serialize};

use crate::world_state::Reward;

/// Outcome reported by the client when a mission finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionResult {
    Ended,
    PlayerDied,
    AgentQuit,
    ModFailedToInstantiateHandlers,
    ModHasNoWorldLoaded,
    ModFailedToCreateWorld,
    ModHasNoAgentAvailable,
    ModServerUnreachable,
    ModServerAbortedMission,
    ModConnectionFailed,
    ModCrashed,
}

impl MissionResult {
    /// Only a regular end or the player's death count as normal.
    pub fn is_normal(self) -> bool {
        matches!(self, MissionResult::Ended | MissionResult::PlayerDied)
    }
}

impl fmt::Display for MissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MissionResult::Ended => "ended",
            MissionResult::PlayerDied => "player_died",
            MissionResult::AgentQuit => "agent_quit",
            MissionResult::ModFailedToInstantiateHandlers => "mod_failed_to_instantiate_handlers",
            MissionResult::ModHasNoWorldLoaded => "mod_has_no_world_loaded",
            MissionResult::ModFailedToCreateWorld => "mod_failed_to_create_world",
            MissionResult::ModHasNoAgentAvailable => "mod_has_no_agent_available",
            MissionResult::ModServerUnreachable => "mod_server_unreachable",
            MissionResult::ModServerAbortedMission => "mod_server_aborted_mission",
            MissionResult::ModConnectionFailed => "mod_connection_failed",
            MissionResult::ModCrashed => "mod_crashed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionEnded {
    pub status: MissionResult,
    #[serde(default)]
    pub human_readable_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<Reward>,
}
