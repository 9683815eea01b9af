use std::fmt;
use std::mem;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod reward;

pub use reward::{Reward, RewardParseError};

/// Text message stamped with its receive time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedString {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl TimestampedString {
    pub fn new(timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }

    pub fn now(text: impl Into<String>) -> Self {
        Self::new(Utc::now(), text)
    }

    /// Line written by recorders: `<ISO-8601 timestamp> <text>`.
    pub fn to_record_line(&self) -> String {
        format!("{} {}", self.timestamp.format("%Y%m%dT%H%M%S%.6f"), self.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedReward {
    pub timestamp: DateTime<Utc>,
    pub reward: Reward,
}

impl TimestampedReward {
    pub fn new(timestamp: DateTime<Utc>, reward: Reward) -> Self {
        Self { timestamp, reward }
    }

    pub fn parse(message: &TimestampedString) -> Result<Self, RewardParseError> {
        let reward = Reward::parse_simple(&message.text)?;
        Ok(Self::new(message.timestamp, reward))
    }
}

/// Position and orientation of the viewpoint that produced a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FramePose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub pitch: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub width: u16,
    pub height: u16,
    pub channels: u8,
    pub pose: FramePose,
    pub pixels: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedVideoFrame {
    pub timestamp: DateTime<Utc>,
    pub frame: VideoFrame,
}

impl TimestampedVideoFrame {
    pub fn new(timestamp: DateTime<Utc>, frame: VideoFrame) -> Self {
        Self { timestamp, frame }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoPolicy {
    #[default]
    LatestFrameOnly,
    KeepAllFrames,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardsPolicy {
    LatestRewardOnly,
    #[default]
    SumRewards,
    KeepAllRewards,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationsPolicy {
    #[default]
    LatestObservationOnly,
    KeepAllObservations,
}

fn keep_latest<T>(mut retained: Vec<T>, incoming: T, keep_all: bool) -> Vec<T> {
    if !keep_all {
        retained.clear();
    }
    retained.push(incoming);
    retained
}

pub fn merge_video_frames(
    retained: Vec<TimestampedVideoFrame>,
    incoming: TimestampedVideoFrame,
    policy: VideoPolicy,
) -> Vec<TimestampedVideoFrame> {
    keep_latest(retained, incoming, policy == VideoPolicy::KeepAllFrames)
}

pub fn merge_observations(
    retained: Vec<TimestampedString>,
    incoming: TimestampedString,
    policy: ObservationsPolicy,
) -> Vec<TimestampedString> {
    keep_latest(
        retained,
        incoming,
        policy == ObservationsPolicy::KeepAllObservations,
    )
}

/// Under `SumRewards` the single retained entry carries the running total and
/// the timestamp of the newest reward.
pub fn merge_rewards(
    mut retained: Vec<TimestampedReward>,
    mut incoming: TimestampedReward,
    policy: RewardsPolicy,
) -> Vec<TimestampedReward> {
    match policy {
        RewardsPolicy::LatestRewardOnly => keep_latest(retained, incoming, false),
        RewardsPolicy::KeepAllRewards => keep_latest(retained, incoming, true),
        RewardsPolicy::SumRewards => {
            if let Some(previous) = retained.first() {
                incoming.reward.add(&previous.reward);
            }
            retained.clear();
            retained.push(incoming);
            retained
        }
    }
}

/// Snapshot of everything received since the last drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldState {
    pub is_mission_running: bool,
    pub has_mission_begun: bool,
    pub number_of_video_frames_since_last_state: usize,
    pub number_of_rewards_since_last_state: usize,
    pub number_of_observations_since_last_state: usize,
    pub video_frames: Vec<TimestampedVideoFrame>,
    pub rewards: Vec<TimestampedReward>,
    pub observations: Vec<TimestampedString>,
    pub mission_control_messages: Vec<TimestampedString>,
    pub errors: Vec<TimestampedString>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets every field, including both running flags.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Swaps in an empty state that keeps only the two running flags and
    /// returns the previous contents.
    pub fn drain(&mut self) -> WorldState {
        let fresh = WorldState {
            is_mission_running: self.is_mission_running,
            has_mission_begun: self.has_mission_begun,
            ..WorldState::default()
        };
        mem::replace(self, fresh)
    }

    pub fn apply_video_frame(&mut self, frame: TimestampedVideoFrame, policy: VideoPolicy) {
        let retained = mem::take(&mut self.video_frames);
        self.video_frames = merge_video_frames(retained, frame, policy);
        self.number_of_video_frames_since_last_state += 1;
    }

    pub fn apply_reward(&mut self, reward: TimestampedReward, policy: RewardsPolicy) {
        let retained = mem::take(&mut self.rewards);
        self.rewards = merge_rewards(retained, reward, policy);
        self.number_of_rewards_since_last_state += 1;
    }

    pub fn apply_observation(&mut self, observation: TimestampedString, policy: ObservationsPolicy) {
        let retained = mem::take(&mut self.observations);
        self.observations = merge_observations(retained, observation, policy);
        self.number_of_observations_since_last_state += 1;
    }

    pub fn push_error(&mut self, timestamp: DateTime<Utc>, text: impl Into<String>) {
        metrics::counter!("world_state.errors").increment(1);
        self.errors.push(TimestampedString::new(timestamp, text));
    }

    pub fn push_mission_control_message(&mut self, message: TimestampedString) {
        self.mission_control_messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.video_frames.is_empty()
            && self.rewards.is_empty()
            && self.observations.is_empty()
            && self.mission_control_messages.is_empty()
            && self.errors.is_empty()
            && self.number_of_video_frames_since_last_state == 0
            && self.number_of_rewards_since_last_state == 0
            && self.number_of_observations_since_last_state == 0
    }
}

impl fmt::Display for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "running={} begun={} frames={}/{} rewards={}/{} observations={}/{} control={} errors={}",
            self.is_mission_running,
            self.has_mission_begun,
            self.video_frames.len(),
            self.number_of_video_frames_since_last_state,
            self.rewards.len(),
            self.number_of_rewards_since_last_state,
            self.observations.len(),
            self.number_of_observations_since_last_state,
            self.mission_control_messages.len(),
            self.errors.len()
        )
    }
}
