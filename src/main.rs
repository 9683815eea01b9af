use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use mission_host::{
    AgentHost, ClientInfo, ClientPool, HostConfig, MissionRecordSpec, MissionSpec, WorldState,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Runs one mission against a pool of clients and reports what comes back.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Mission description (JSON)
    #[arg(long, value_name = "FILE")]
    mission: PathBuf,

    /// Candidate client as HOST or HOST:PORT; repeat for a pool
    #[arg(long = "client", value_name = "HOST[:PORT]")]
    clients: Vec<ClientInfo>,

    /// Index of the agent this process plays
    #[arg(long, default_value_t = 0)]
    role: usize,

    /// Shared experiment id; generated when omitted
    #[arg(long)]
    experiment_id: Option<String>,

    /// Record commands, rewards, observations and video into this directory
    #[arg(long, value_name = "DIR")]
    record_dir: Option<PathBuf>,

    /// Log negotiation traffic at info level
    #[arg(long)]
    debug: bool,

    /// Command to send once the mission is running; repeatable
    #[arg(long = "command", value_name = "TEXT")]
    commands: Vec<String>,

    /// Interval between world state polls
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Give up if the mission has not ended after this many seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

impl Cli {
    fn pool(&self) -> ClientPool {
        if self.clients.is_empty() {
            ClientPool::local()
        } else {
            self.clients.iter().cloned().collect()
        }
    }

    fn record_spec(&self) -> MissionRecordSpec {
        match &self.record_dir {
            Some(dir) => MissionRecordSpec::new()
                .with_destination(dir)
                .record_commands()
                .record_rewards()
                .record_observations()
                .record_video(20, 400_000),
            None => MissionRecordSpec::new(),
        }
    }
}

fn report(state: &WorldState) {
    for error in &state.errors {
        warn!(error = %error.text, "mission error");
    }
    if state.number_of_rewards_since_last_state > 0 {
        for reward in &state.rewards {
            info!(reward = %reward.reward, "reward");
        }
    }
    if state.number_of_observations_since_last_state > 0
        || state.number_of_video_frames_since_last_state > 0
    {
        info!(
            observations = state.number_of_observations_since_last_state,
            frames = state.number_of_video_frames_since_last_state,
            "telemetry received"
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let text = fs::read_to_string(&cli.mission)
        .with_context(|| format!("failed to read mission {}", cli.mission.display()))?;
    let mission = MissionSpec::from_json(&text).context("invalid mission description")?;

    let mut config = HostConfig::from_env().context("invalid host configuration")?;
    config.debug_negotiation |= cli.debug;
    let host = AgentHost::new(config).context("failed to start agent host")?;

    let experiment_id = cli
        .experiment_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(%experiment_id, role = cli.role, agents = mission.agent_count(), "starting mission");
    host.start_mission(
        &mission,
        &cli.pool(),
        &cli.record_spec(),
        cli.role,
        &experiment_id,
    )
    .context("failed to start mission")?;

    let poll = Duration::from_millis(cli.poll_ms.max(1));
    let deadline = Instant::now() + Duration::from_secs(cli.timeout_secs);
    let mut pending = cli.commands.iter();
    loop {
        let state = host.get_world_state()?;
        report(&state);
        if state.has_mission_begun && !state.is_mission_running {
            info!("mission finished");
            break;
        }
        if state.is_mission_running {
            if let Some(command) = pending.next() {
                host.send_command(command)?;
            }
        }
        if Instant::now() >= deadline {
            host.close()?;
            bail!("mission did not finish within {} seconds", cli.timeout_secs);
        }
        thread::sleep(poll);
    }

    if let Some(dir) = host.recording_directory()? {
        info!(directory = %dir.display(), "mission recorded");
    }
    Ok(())
}
