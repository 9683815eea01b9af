use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const MISSION_INIT_FILE: &str = "mission_init.json";
const COMMANDS_FILE: &str = "commands.txt";
const REWARDS_FILE: &str = "rewards.txt";
const OBSERVATIONS_FILE: &str = "observations.txt";
const VIDEO_FILE: &str = "video.raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp4Settings {
    pub frames_per_second: u32,
    pub bit_rate: u64,
}

/// What the agent wants recorded for a mission, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissionRecordSpec {
    destination: Option<PathBuf>,
    commands: bool,
    rewards: bool,
    observations: bool,
    video: Option<Mp4Settings>,
}

impl MissionRecordSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn record_commands(mut self) -> Self {
        self.commands = true;
        self
    }

    pub fn record_rewards(mut self) -> Self {
        self.rewards = true;
        self
    }

    pub fn record_observations(mut self) -> Self {
        self.observations = true;
        self
    }

    pub fn record_video(mut self, frames_per_second: u32, bit_rate: u64) -> Self {
        self.video = Some(Mp4Settings {
            frames_per_second,
            bit_rate,
        });
        self
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }
}

/// A [`MissionRecordSpec`] resolved to concrete file paths. Nothing is
/// recorded without a destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionRecord {
    spec: MissionRecordSpec,
}

impl MissionRecord {
    pub fn new(spec: MissionRecordSpec) -> Self {
        Self { spec }
    }

    pub fn is_recording(&self) -> bool {
        self.spec.destination.is_some()
    }

    pub fn directory(&self) -> Option<&Path> {
        self.spec.destination()
    }

    /// Creates the destination directory when recording.
    pub fn prepare(&self) -> io::Result<()> {
        match self.directory() {
            Some(dir) => fs::create_dir_all(dir),
            None => Ok(()),
        }
    }

    fn path_if(&self, enabled: bool, file: &str) -> Option<PathBuf> {
        if enabled {
            self.directory().map(|dir| dir.join(file))
        } else {
            None
        }
    }

    pub fn mission_init_path(&self) -> Option<PathBuf> {
        self.path_if(true, MISSION_INIT_FILE)
    }

    pub fn commands_path(&self) -> Option<PathBuf> {
        self.path_if(self.spec.commands, COMMANDS_FILE)
    }

    pub fn rewards_path(&self) -> Option<PathBuf> {
        self.path_if(self.spec.rewards, REWARDS_FILE)
    }

    pub fn observations_path(&self) -> Option<PathBuf> {
        self.path_if(self.spec.observations, OBSERVATIONS_FILE)
    }

    pub fn video_path(&self) -> Option<PathBuf> {
        self.path_if(self.spec.video.is_some(), VIDEO_FILE)
    }

    pub fn video_settings(&self) -> Option<Mp4Settings> {
        self.spec.video.filter(|_| self.is_recording())
    }
}
