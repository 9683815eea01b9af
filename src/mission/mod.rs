//! Documents exchanged with a client over the course of a mission.

pub mod document;
pub mod ended;
pub mod init;
pub mod record;
pub mod spec;

pub use document::{parse_body, ControlDocument, DocumentError};
pub use ended::{MissionEnded, MissionResult};
pub use init::{ClientAgentConnection, MissionInit, ServerLocation};
pub use record::{MissionRecord, MissionRecordSpec, Mp4Settings};
pub use spec::{AgentSection, MissionSpec, VideoRequest};
