//! Mission lifecycle controller.
//!
//! [`AgentHost`] owns a background [`ExecutionContext`] and one shared state
//! guarded by a single async mutex. The agent's thread blocks on that context
//! for every call; listener handlers running on the context take the same
//! lock, so telemetry merges, commands and state reads never interleave.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::commands::CommandChannel;
use crate::compat::{check_protocol_version, CompatError};
use crate::config::{ConfigError, HostConfig};
use crate::discovery::{
    find_client, find_server, reserve_clients, ClientPool, DiscoveryError, Prober, ReplyTransport,
    ReservationRequest, TcpReplyTransport,
};
use crate::listeners::{
    FileRecorder, FrameHandler, ListenerError, ListenerHandlers, ListenerSet, ListenerSettings,
    MessageHandler,
};
use crate::mission::{
    parse_body, ControlDocument, DocumentError, MissionEnded, MissionInit, MissionRecord,
    MissionRecordSpec, MissionSpec,
};
use crate::runtime::{ExecutionContext, RuntimeError, SocketConfigurator};
use crate::world_state::{
    ObservationsPolicy, RewardsPolicy, TimestampedReward, TimestampedString,
    TimestampedVideoFrame, VideoPolicy, WorldState,
};

const COMMANDS_NOT_OPEN: &str = "commands connection is not open. Is the mission running?";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("role {role} is out of range for a mission with {agents} agent(s)")]
    InvalidRole { role: usize, agents: usize },
    #[error("requested video width {0} is not a multiple of 4")]
    InvalidVideoWidth(u16),
    #[error("requested video height {0} is not a multiple of 2")]
    InvalidVideoHeight(u16),
    #[error("a mission is already running")]
    MissionAlreadyRunning,
    #[error("not enough clients in the client pool: {required} required, {available} in the pool")]
    NotEnoughClients { required: usize, available: usize },
    #[error("failed to find the mission server in the client pool")]
    ServerNotFound,
    #[error("failed to find an available client for this mission, tried every client in the pool")]
    NoAvailableClient,
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to encode mission document: {0}")]
    Document(#[from] DocumentError),
    #[error("failed to write mission recording: {0}")]
    Record(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Compat(#[from] CompatError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Where the host is in the mission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionPhase {
    Idle,
    /// A client accepted the mission; waiting for its `MissionInit`.
    Negotiating,
    Running,
    Ended,
}

struct HostState {
    world_state: WorldState,
    mission_init: Option<MissionInit>,
    record: Option<MissionRecord>,
    role: usize,
    phase: MissionPhase,
    video_policy: VideoPolicy,
    rewards_policy: RewardsPolicy,
    observations_policy: ObservationsPolicy,
    debug_output: bool,
    command_channel: Option<CommandChannel>,
    command_log: Option<FileRecorder>,
    listeners: ListenerSet,
}

impl HostState {
    fn new(debug_output: bool) -> Self {
        Self {
            world_state: WorldState::new(),
            mission_init: None,
            record: None,
            role: 0,
            phase: MissionPhase::Idle,
            video_policy: VideoPolicy::default(),
            rewards_policy: RewardsPolicy::default(),
            observations_policy: ObservationsPolicy::default(),
            debug_output,
            command_channel: None,
            command_log: None,
            listeners: ListenerSet::new(),
        }
    }

    fn push_error(&mut self, message: &TimestampedString, text: impl Into<String>) {
        let text = text.into();
        warn!(error = %text, "mission error");
        self.world_state.push_error(message.timestamp, text);
    }

    /// Ends the current mission. Listeners stay bound for reuse.
    async fn close(&mut self) {
        self.world_state.is_mission_running = false;
        self.phase = match self.phase {
            MissionPhase::Running | MissionPhase::Ended => MissionPhase::Ended,
            MissionPhase::Idle | MissionPhase::Negotiating => MissionPhase::Idle,
        };
        self.listeners.stop_recording().await;
        if let Some(mut log) = self.command_log.take() {
            log.close().await;
        }
        if let Some(channel) = self.command_channel.take() {
            debug!(peer = channel.peer(), "command channel closed");
        }
        metrics::gauge!("host.mission_running").set(0.0);
    }
}

/// State shared between the host and the listener handlers.
pub struct HostShared {
    state: Mutex<HostState>,
    config: HostConfig,
    transport: Arc<dyn ReplyTransport>,
    sockets: SocketConfigurator,
    settings: ListenerSettings,
    has_mission_init: AtomicBool,
}

#[derive(Clone, Copy, Debug)]
enum TextChannel {
    MissionControl,
    Rewards,
    Observations,
}

struct TextDelivery {
    host: Arc<HostShared>,
    channel: TextChannel,
}

#[async_trait]
impl MessageHandler for TextDelivery {
    async fn on_message(&self, message: TimestampedString) {
        match self.channel {
            TextChannel::MissionControl => self.host.on_mission_control_message(message).await,
            TextChannel::Rewards => self.host.on_reward(message).await,
            TextChannel::Observations => self.host.on_observation(message).await,
        }
    }
}

struct FrameDelivery {
    host: Arc<HostShared>,
}

#[async_trait]
impl FrameHandler for FrameDelivery {
    async fn on_frame(&self, frame: TimestampedVideoFrame) {
        self.host.on_video(frame).await;
    }
}

fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

impl HostShared {
    fn handlers(self: &Arc<Self>) -> ListenerHandlers {
        let text = |channel| -> Arc<dyn MessageHandler> {
            Arc::new(TextDelivery {
                host: Arc::clone(self),
                channel,
            })
        };
        ListenerHandlers {
            mission_control: text(TextChannel::MissionControl),
            rewards: text(TextChannel::Rewards),
            observations: text(TextChannel::Observations),
            video: Arc::new(FrameDelivery {
                host: Arc::clone(self),
            }),
        }
    }

    async fn start_mission(
        self: &Arc<Self>,
        mission: &MissionSpec,
        pool: &ClientPool,
        record_spec: &MissionRecordSpec,
        role: usize,
        experiment_id: &str,
    ) -> Result<(), HostError> {
        let mut guard = self.state.lock().await;
        if guard.world_state.is_mission_running {
            return Err(HostError::MissionAlreadyRunning);
        }
        guard.phase = MissionPhase::Negotiating;

        let result = self
            .negotiate(&mut guard, mission, pool, record_spec, role, experiment_id)
            .await;
        match &result {
            Ok(()) => {
                metrics::counter!("host.missions", "outcome" => "accepted").increment(1);
            }
            Err(err) => {
                metrics::counter!("host.missions", "outcome" => "failed").increment(1);
                warn!(error = %err, role, experiment_id, "mission start failed");
                guard.close().await;
                guard.listeners.shutdown().await;
            }
        }
        result
    }

    async fn negotiate(
        self: &Arc<Self>,
        state: &mut HostState,
        mission: &MissionSpec,
        pool: &ClientPool,
        record_spec: &MissionRecordSpec,
        role: usize,
        experiment_id: &str,
    ) -> Result<(), HostError> {
        let agents = mission.agent_count();
        let mut init = MissionInit::new(
            mission.clone(),
            experiment_id,
            role,
            self.config.protocol_version.as_str(),
            self.config.advertised_address.as_str(),
        );
        let record = MissionRecord::new(record_spec.clone());
        record.prepare().map_err(HostError::Record)?;
        state.role = role;

        self.initialize_listeners(state, &mut init, mission, &record).await?;

        if let Some(mut log) = state.command_log.take() {
            log.close().await;
        }
        if let Some(path) = record.commands_path() {
            let log = FileRecorder::create(&path).await.map_err(HostError::Record)?;
            state.command_log = Some(log);
        }
        state.record = Some(record);

        let prober = Prober::new(self.transport.as_ref()).verbose(state.debug_output);

        let reserved;
        let mut candidates = pool;
        if agents > 1 && role == 0 {
            let request = ReservationRequest {
                version: self.config.protocol_version.clone(),
                reservation_timeout: self.config.reservation_timeout,
                experiment_id: experiment_id.to_string(),
            };
            reserved = reserve_clients(&prober, pool, agents, &request).await;
            if reserved.is_empty() {
                return Err(HostError::NotEnoughClients {
                    required: agents,
                    available: pool.len(),
                });
            }
            info!(reserved = reserved.len(), "reserved clients for mission");
            // Only reserved clients are offered the mission.
            candidates = &reserved;
        }

        if agents > 1 && role > 0 && !init.has_server() {
            match find_server(&prober, pool, experiment_id).await? {
                Some(server) => init.server = Some(server),
                None => return Err(HostError::ServerNotFound),
            }
        }

        let accepted = find_client(&prober, candidates, role, |client| {
            init.set_client(&client.address, client.port);
            init.to_document().map(|mut document| {
                document.push('\n');
                document
            })
        })
        .await?;
        let Some(client) = accepted else {
            return Err(HostError::NoAvailableClient);
        };

        info!(client = %client, role, experiment_id, "mission accepted, waiting for it to start");
        state.world_state.clear();
        if let Some(path) = state.record.as_ref().and_then(MissionRecord::mission_init_path) {
            tokio::fs::write(&path, init.to_pretty_document()?)
                .await
                .map_err(HostError::Record)?;
        }
        state.mission_init = Some(init);
        self.has_mission_init.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Binds or reuses the four listeners and writes their effective ports
    /// into `init`.
    async fn initialize_listeners(
        self: &Arc<Self>,
        state: &mut HostState,
        init: &mut MissionInit,
        mission: &MissionSpec,
        record: &MissionRecord,
    ) -> Result<(), HostError> {
        let handlers = self.handlers();
        let settings = &self.settings;
        let connection = &mut init.connection;
        let listeners = &mut state.listeners;

        connection.agent_mission_control_port = listeners
            .ensure_mission_control(
                connection.agent_mission_control_port,
                settings,
                handlers.mission_control,
            )
            .await?;

        if let Some(video) = mission.video_request(state.role) {
            let video_path = record.video_path();
            let recording = video_path.as_deref().zip(record.video_settings());
            listeners
                .ensure_video(
                    connection.agent_video_port,
                    *video,
                    settings,
                    handlers.video,
                    recording,
                )
                .await?;
        }

        let rewards_path = record.rewards_path();
        connection.agent_rewards_port = listeners
            .ensure_rewards(
                connection.agent_rewards_port,
                settings,
                handlers.rewards,
                rewards_path.as_deref(),
            )
            .await?;

        let observations_path = record.observations_path();
        connection.agent_observations_port = listeners
            .ensure_observations(
                connection.agent_observations_port,
                settings,
                handlers.observations,
                observations_path.as_deref(),
            )
            .await?;

        if let Some(port) = listeners.video_port() {
            connection.agent_video_port = port;
        }
        Ok(())
    }

    async fn on_mission_control_message(&self, message: TimestampedString) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let document = match ControlDocument::classify(&message.text) {
            Ok(document) => document,
            Err(DocumentError::Empty) => {
                state.push_error(&message, "Empty mission control message");
                return;
            }
            Err(err) => {
                let text = format!(
                    "Error parsing mission control message: {err}: {}...",
                    excerpt(&message.text, 20)
                );
                state.push_error(&message, text);
                return;
            }
        };
        debug!(root = document.root(), "mission control message");

        match document {
            ControlDocument::MissionInit(body) if !state.world_state.is_mission_running => {
                self.on_mission_init(state, body, &message).await;
            }
            ControlDocument::MissionEnded(body) => {
                self.on_mission_ended(state, body, &message).await;
            }
            ControlDocument::Ping => {}
            other => {
                let text = format!(
                    "Unknown mission control message root node or at wrong time: {} :{}...",
                    other.root(),
                    excerpt(&message.text, 200)
                );
                state.push_error(&message, text);
            }
        }
        state.world_state.push_mission_control_message(message);
    }

    async fn on_mission_init(
        &self,
        state: &mut HostState,
        body: serde_json::Value,
        message: &TimestampedString,
    ) {
        let init: MissionInit = match parse_body(body) {
            Ok(init) => init,
            Err(err) => {
                let text = format!(
                    "Error parsing MissionInit message: {err}: {}...",
                    excerpt(&message.text, 20)
                );
                state.push_error(message, text);
                return;
            }
        };

        state.world_state.is_mission_running = true;
        state.world_state.has_mission_begun = true;
        state.phase = MissionPhase::Running;
        metrics::gauge!("host.mission_running").set(1.0);

        let address = init.connection.client_address.clone();
        let port = init.connection.client_commands_port;
        state.mission_init = Some(init);
        info!(client_address = %address, commands_port = port, "mission started");

        if port == 0 {
            state.push_error(
                message,
                "client commands port is unknown, cannot open the commands connection",
            );
            return;
        }
        match CommandChannel::connect(&self.sockets, &address, port, self.config.command_timeout)
            .await
        {
            Ok(channel) => state.command_channel = Some(channel),
            Err(err) => {
                state.push_error(message, format!("failed to open commands connection: {err}"));
            }
        }
    }

    async fn on_mission_ended(
        &self,
        state: &mut HostState,
        body: serde_json::Value,
        message: &TimestampedString,
    ) {
        match parse_body::<MissionEnded>(body) {
            Ok(ended) => {
                info!(status = %ended.status, "mission ended");
                if !ended.status.is_normal() {
                    state.push_error(
                        message,
                        format!("Mission ended abnormally: {}", ended.human_readable_status),
                    );
                }
                if state.world_state.is_mission_running {
                    if let Some(reward) = ended.reward {
                        let line =
                            TimestampedString::new(message.timestamp, reward.to_simple_string());
                        let policy = state.rewards_policy;
                        state
                            .world_state
                            .apply_reward(TimestampedReward::new(message.timestamp, reward), policy);
                        state.listeners.record_reward_message(&line).await;
                    }
                }
            }
            Err(err) => {
                let text = format!(
                    "Error parsing MissionEnded message: {err}: {}...",
                    excerpt(&message.text, 20)
                );
                state.push_error(message, text);
            }
        }
        state.close().await;
    }

    async fn on_reward(&self, message: TimestampedString) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match TimestampedReward::parse(&message) {
            Ok(reward) => {
                let policy = state.rewards_policy;
                state.world_state.apply_reward(reward, policy);
            }
            Err(err) => {
                let text = format!("Error parsing Reward message: {err}: {}", message.text);
                state.push_error(&message, text);
            }
        }
    }

    async fn on_observation(&self, message: TimestampedString) {
        let mut guard = self.state.lock().await;
        let policy = guard.observations_policy;
        guard.world_state.apply_observation(message, policy);
    }

    async fn on_video(&self, frame: TimestampedVideoFrame) {
        let mut guard = self.state.lock().await;
        let policy = guard.video_policy;
        guard.world_state.apply_video_frame(frame, policy);
    }

    async fn send_command(&self, command: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = TimestampedString::now(command);
        let Some(channel) = state.command_channel.as_mut() else {
            state.push_error(&now, COMMANDS_NOT_OPEN);
            return;
        };
        let result = channel.send(command).await;
        match result {
            Ok(()) => {
                if let Some(log) = &state.command_log {
                    log.record(&now);
                }
            }
            Err(err) => {
                metrics::counter!("commands.failed").increment(1);
                state.push_error(&now, format!("failed to send command: {err}"));
            }
        }
    }
}

/// Connects an agent to remote simulation clients and aggregates what they
/// stream back.
///
/// Every method blocks the calling thread on the host's own runtime, so an
/// `AgentHost` must not be driven from inside another async runtime; such
/// calls fail with [`RuntimeError::NestedRuntime`].
pub struct AgentHost {
    shared: Arc<HostShared>,
    context: ExecutionContext,
}

impl AgentHost {
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        let transport = Arc::new(TcpReplyTransport::new(config.probe_timeout));
        Self::with_transport(config, transport)
    }

    pub fn from_env() -> Result<Self, HostError> {
        Self::new(HostConfig::from_env()?)
    }

    /// Builds a host that negotiates through `transport`.
    pub fn with_transport(
        config: HostConfig,
        transport: Arc<dyn ReplyTransport>,
    ) -> Result<Self, HostError> {
        let version = check_protocol_version(&config.protocol_version)?;
        let context = ExecutionContext::new(config.worker_threads())?;
        let sockets = SocketConfigurator::new();
        let settings = ListenerSettings {
            listen_address: config.listen_address,
            max_frame_bytes: config.max_frame_bytes,
            sockets: sockets.clone(),
        };
        info!(%version, workers = config.worker_threads(), "agent host ready");
        let shared = Arc::new(HostShared {
            state: Mutex::new(HostState::new(config.debug_negotiation)),
            config,
            transport,
            sockets,
            settings,
            has_mission_init: AtomicBool::new(false),
        });
        Ok(Self { shared, context })
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Negotiates `mission` with a client from `pool` and returns once a
    /// client has accepted it. The mission counts as running only after that
    /// client's `MissionInit` arrives on the mission-control listener.
    pub fn start_mission(
        &self,
        mission: &MissionSpec,
        pool: &ClientPool,
        record_spec: &MissionRecordSpec,
        role: usize,
        experiment_id: &str,
    ) -> Result<(), HostError> {
        let agents = mission.agent_count();
        if role >= agents {
            return Err(HostError::InvalidRole { role, agents });
        }
        if let Some(video) = mission.video_request(role) {
            if video.width % 4 != 0 {
                return Err(HostError::InvalidVideoWidth(video.width));
            }
            if video.height % 2 != 0 {
                return Err(HostError::InvalidVideoHeight(video.height));
            }
        }
        let shared = &self.shared;
        self.context.block_on(shared.start_mission(
            mission,
            pool,
            record_spec,
            role,
            experiment_id,
        ))?
    }

    /// Single-agent shorthand using the local client at `127.0.0.1:10000`.
    pub fn start_single_agent_mission(
        &self,
        mission: &MissionSpec,
        record_spec: &MissionRecordSpec,
    ) -> Result<(), HostError> {
        self.start_mission(mission, &ClientPool::local(), record_spec, 0, "")
    }

    /// Copy of the current world state; nothing is reset.
    pub fn peek_world_state(&self) -> Result<WorldState, HostError> {
        Ok(self
            .context
            .block_on(async { self.shared.state.lock().await.world_state.clone() })?)
    }

    /// Returns everything received since the last call and resets the
    /// sequences and counters. The running flags carry over.
    pub fn get_world_state(&self) -> Result<WorldState, HostError> {
        let drained = self
            .context
            .block_on(async { self.shared.state.lock().await.world_state.drain() })?;
        metrics::counter!("world_state.drains").increment(1);
        Ok(drained)
    }

    /// Sends one command to the client. Failures are reported through the
    /// world state's error list.
    pub fn send_command(&self, command: &str) -> Result<(), HostError> {
        Ok(self.context.block_on(self.shared.send_command(command))?)
    }

    pub fn set_video_policy(&self, policy: VideoPolicy) -> Result<(), HostError> {
        self.with_state(|state| state.video_policy = policy)
    }

    pub fn set_rewards_policy(&self, policy: RewardsPolicy) -> Result<(), HostError> {
        self.with_state(|state| state.rewards_policy = policy)
    }

    pub fn set_observations_policy(&self, policy: ObservationsPolicy) -> Result<(), HostError> {
        self.with_state(|state| state.observations_policy = policy)
    }

    /// Logs every negotiation request and reply at `info` instead of `debug`.
    pub fn set_debug_output(&self, debug: bool) -> Result<(), HostError> {
        self.with_state(|state| state.debug_output = debug)
    }

    pub fn mission_init(&self) -> Result<Option<MissionInit>, HostError> {
        self.with_state(|state| state.mission_init.clone())
    }

    pub fn phase(&self) -> Result<MissionPhase, HostError> {
        self.with_state(|state| state.phase)
    }

    pub fn role(&self) -> Result<usize, HostError> {
        self.with_state(|state| state.role)
    }

    /// Directory the current mission records into, if recording.
    pub fn recording_directory(&self) -> Result<Option<PathBuf>, HostError> {
        self.with_state(|state| {
            state
                .record
                .as_ref()
                .and_then(MissionRecord::directory)
                .map(PathBuf::from)
        })
    }

    /// Ends the current mission: stops recording and drops the command
    /// channel. Safe to call repeatedly.
    pub fn close(&self) -> Result<(), HostError> {
        Ok(self
            .context
            .block_on(async { self.shared.state.lock().await.close().await })?)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> Result<T, HostError> {
        Ok(self.context.block_on(async {
            let mut guard = self.shared.state.lock().await;
            f(&mut guard)
        })?)
    }
}

impl fmt::Display for AgentHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shared.has_mission_init.load(Ordering::SeqCst) {
            f.write_str("AgentHost: active (with mission)")
        } else {
            f.write_str("AgentHost: uninitialised (no mission init)")
        }
    }
}

impl Drop for AgentHost {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        let teardown = async move {
            let mut listeners = {
                let mut state = shared.state.lock().await;
                state.close().await;
                std::mem::take(&mut state.listeners)
            };
            listeners.shutdown().await;
        };
        if let Err(err) = self.context.block_on(teardown) {
            warn!(error = %err, "agent host dropped without a clean listener shutdown");
        }
        self.context.shutdown();
    }
}
