use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_channels() -> u8 {
    3
}

/// Video stream requested by one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub width: u16,
    pub height: u16,
    #[serde(default = "default_channels")]
    pub channels: u8,
}

impl VideoRequest {
    pub fn new(width: u16, height: u16, channels: u8) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Payload size of one frame, excluding the pose header.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoRequest>,
}

impl AgentSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            video: None,
        }
    }

    pub fn with_video(mut self, video: VideoRequest) -> Self {
        self.video = Some(video);
        self
    }
}

/// Mission description supplied by the agent. Everything outside the agent
/// sections is carried through untouched in `content`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    pub agents: Vec<AgentSection>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
}

impl MissionSpec {
    pub fn new(agents: Vec<AgentSection>) -> Self {
        Self {
            agents,
            content: Value::Null,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn video_request(&self, role: usize) -> Option<&VideoRequest> {
        self.agents.get(role).and_then(|agent| agent.video.as_ref())
    }

    pub fn is_video_requested(&self, role: usize) -> bool {
        self.video_request(role).is_some()
    }
}
