mod support;

use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mission_host::discovery::{DiscoveryError, CANCEL_REQUEST};
use mission_host::mission::{MissionInit, MissionRecordSpec};
use mission_host::runtime::RuntimeError;
use mission_host::world_state::{ObservationsPolicy, RewardsPolicy};
use mission_host::{AgentHost, ClientPool, HostError, MissionPhase, WorldState};
use support::{
    pool_of, scratch_dir, single_agent_mission, test_config, two_agent_mission, video_mission,
    video_payload, wait_until, FakeClient, ScriptedTransport,
};

const WAIT: Duration = Duration::from_secs(10);

fn scripted_host(transport: Arc<ScriptedTransport>) -> AgentHost {
    AgentHost::with_transport(test_config(), transport).expect("agent host")
}

fn tcp_host() -> AgentHost {
    AgentHost::new(test_config()).expect("agent host")
}

fn wait_for_phase(host: &AgentHost, phase: MissionPhase) {
    assert!(
        wait_until(WAIT, || host.phase().expect("phase") == phase),
        "host never reached {phase:?}, still {:?}",
        host.phase()
    );
}

/// Waits until `check` holds for the current world state, without draining.
fn wait_for_state(host: &AgentHost, check: impl Fn(&WorldState) -> bool) -> WorldState {
    let mut last = WorldState::new();
    let reached = wait_until(WAIT, || {
        last = host.peek_world_state().expect("peek");
        check(&last)
    });
    assert!(reached, "world state never matched: {last}");
    last
}

/// Starts a one-agent mission on `client` and drives it to running.
fn start_running(host: &AgentHost, client: &FakeClient, record: &MissionRecordSpec) {
    start_running_mission(host, client, record, &single_agent_mission());
}

fn start_running_mission(
    host: &AgentHost,
    client: &FakeClient,
    record: &MissionRecordSpec,
    mission: &mission_host::MissionSpec,
) {
    host.start_mission(mission, &pool_of(&[client.port()]), record, 0, "exp-1")
        .expect("start mission");
    assert_eq!(host.phase().expect("phase"), MissionPhase::Negotiating);
    let mut control = client.mission_control();
    control.send_text(&client.mission_init_document());
    wait_for_phase(host, MissionPhase::Running);
}

#[test]
fn invalid_role_is_rejected_before_negotiation() {
    let transport = ScriptedTransport::replying("MALMOOK");
    let host = scripted_host(transport.clone());

    let err = host
        .start_mission(
            &single_agent_mission(),
            &pool_of(&[10000]),
            &MissionRecordSpec::new(),
            1,
            "exp",
        )
        .expect_err("role out of range");

    assert!(matches!(err, HostError::InvalidRole { role: 1, agents: 1 }));
    assert!(transport.requests().is_empty());
    assert_eq!(host.phase().expect("phase"), MissionPhase::Idle);
    assert!(host.mission_init().expect("mission init").is_none());
}

#[test]
fn video_geometry_is_validated_before_negotiation() {
    let transport = ScriptedTransport::replying("MALMOOK");
    let host = scripted_host(transport.clone());
    let pool = pool_of(&[10000]);
    let record = MissionRecordSpec::new();

    let err = host
        .start_mission(&video_mission(101, 100, 3), &pool, &record, 0, "exp")
        .expect_err("width");
    assert!(matches!(err, HostError::InvalidVideoWidth(101)));

    let err = host
        .start_mission(&video_mission(100, 99, 3), &pool, &record, 0, "exp")
        .expect_err("height");
    assert!(matches!(err, HostError::InvalidVideoHeight(99)));

    assert!(transport.requests().is_empty());
    assert!(host.mission_init().expect("mission init").is_none());
    assert_eq!(host.phase().expect("phase"), MissionPhase::Idle);
}

#[test]
fn no_available_client_fails_the_start() {
    let transport = ScriptedTransport::new(|client, _| match client.port {
        10001 => None,
        _ => Some("MALMOBUSY".into()),
    });
    let host = scripted_host(transport.clone());

    let err = host
        .start_mission(
            &single_agent_mission(),
            &pool_of(&[10000, 10001, 10002]),
            &MissionRecordSpec::new(),
            0,
            "exp",
        )
        .expect_err("nobody accepts");

    assert!(matches!(err, HostError::NoAvailableClient));
    assert_eq!(transport.ports_probed(), vec![10000, 10001, 10002]);
    assert!(transport
        .requests()
        .iter()
        .all(|(_, payload)| payload.starts_with("{\"MissionInit\":")));
    assert_eq!(host.phase().expect("phase"), MissionPhase::Idle);
    assert!(host.mission_init().expect("mission init").is_none());
    assert_eq!(host.to_string(), "AgentHost: uninitialised (no mission init)");
}

#[test]
fn first_role_reserves_the_pool_and_cancels_on_shortfall() {
    let transport = ScriptedTransport::new(|client, _| match client.port {
        10000 => Some("MALMOOK".into()),
        10001 => None,
        _ => Some("MALMOBUSY".into()),
    });
    let host = scripted_host(transport.clone());

    let err = host
        .start_mission(
            &two_agent_mission(),
            &pool_of(&[10000, 10001, 10002]),
            &MissionRecordSpec::new(),
            0,
            "exp-9",
        )
        .expect_err("only one client reserved");

    assert!(matches!(
        err,
        HostError::NotEnoughClients {
            required: 2,
            available: 3
        }
    ));
    assert_eq!(
        transport.requests_to(10000),
        vec![
            "MALMO_REQUEST_CLIENT:0.37.0:20000:exp-9\n".to_string(),
            CANCEL_REQUEST.to_string(),
        ]
    );
}

#[test]
fn later_roles_locate_the_server_first() {
    let transport = ScriptedTransport::new(|client, payload| {
        if payload.starts_with("MALMO_FIND_SERVER") {
            return Some(match client.port {
                10000 => "MALMOS10.0.0.9:25565".into(),
                _ => "MALMONOSERVER".into(),
            });
        }
        match client.port {
            10001 => Some("MALMOOK".into()),
            _ => Some("MALMOBUSY".into()),
        }
    });
    let host = scripted_host(transport.clone());

    host.start_mission(
        &two_agent_mission(),
        &pool_of(&[10000, 10001]),
        &MissionRecordSpec::new(),
        1,
        "exp-2",
    )
    .expect("start mission");

    let requests = transport.requests();
    assert_eq!(requests[0].1, "MALMO_FIND_SERVERexp-2\n");
    // find_client starts at the agent's own role.
    assert_eq!(requests[1].0.port, 10001);
    assert!(requests[1].1.contains("\"address\":\"10.0.0.9\""));

    let init = host.mission_init().expect("mission init").expect("negotiated");
    assert_eq!(init.role, 1);
    assert_eq!(init.experiment_id, "exp-2");
    let server = init.server.expect("server location");
    assert_eq!((server.address.as_str(), server.port), ("10.0.0.9", 25565));
    assert_eq!(init.connection.client_mission_control_port, 10001);
    assert_eq!(host.phase().expect("phase"), MissionPhase::Negotiating);
    assert_eq!(host.to_string(), "AgentHost: active (with mission)");
    assert!(!host.peek_world_state().expect("peek").is_mission_running);
}

#[test]
fn malformed_server_reply_fails_the_start() {
    let transport = ScriptedTransport::replying("MALMOSnowhere");
    let host = scripted_host(transport);

    let err = host
        .start_mission(
            &two_agent_mission(),
            &pool_of(&[10000]),
            &MissionRecordSpec::new(),
            1,
            "exp",
        )
        .expect_err("malformed");

    assert!(matches!(
        err,
        HostError::Discovery(DiscoveryError::MalformedReply(_))
    ));
    assert_eq!(host.phase().expect("phase"), MissionPhase::Idle);
}

#[test]
fn first_role_offers_the_mission_only_to_reserved_clients() {
    let transport = ScriptedTransport::new(|client, payload| {
        match (client.port, payload.starts_with("MALMO_REQUEST_CLIENT")) {
            (10000, true) => Some("MALMOBUSY".into()),
            _ => Some("MALMOOK".into()),
        }
    });
    let host = scripted_host(transport.clone());

    host.start_mission(
        &two_agent_mission(),
        &pool_of(&[10000, 10001, 10002]),
        &MissionRecordSpec::new(),
        0,
        "exp-3",
    )
    .expect("start mission");

    let offered: Vec<u16> = transport
        .requests()
        .iter()
        .filter(|(_, payload)| payload.starts_with("{\"MissionInit\":"))
        .map(|(client, _)| client.port)
        .collect();
    assert_eq!(offered, vec![10001]);
    assert_eq!(transport.requests_to(10000).len(), 1);
    let init = host.mission_init().expect("mission init").expect("negotiated");
    assert_eq!(init.connection.client_mission_control_port, 10001);
    assert_eq!(host.phase().expect("phase"), MissionPhase::Negotiating);
}

#[test]
fn later_role_without_server_fails_and_releases_listeners() {
    let server_gone = Arc::new(AtomicBool::new(false));
    let transport = {
        let server_gone = Arc::clone(&server_gone);
        ScriptedTransport::new(move |_, payload| {
            if payload.starts_with("MALMO_FIND_SERVER") {
                return Some(if server_gone.load(Ordering::SeqCst) {
                    "MALMONOSERVER".into()
                } else {
                    "MALMOS10.0.0.9:25565".into()
                });
            }
            Some("MALMOOK".into())
        })
    };
    let host = scripted_host(transport);
    let pool = pool_of(&[10000, 10001]);
    let record = MissionRecordSpec::new();

    host.start_mission(&two_agent_mission(), &pool, &record, 1, "exp-4")
        .expect("first start");
    let ports = host
        .mission_init()
        .expect("mission init")
        .expect("negotiated")
        .connection;
    assert!(StdTcpStream::connect(("127.0.0.1", ports.agent_mission_control_port)).is_ok());

    server_gone.store(true, Ordering::SeqCst);
    let err = host
        .start_mission(&two_agent_mission(), &pool, &record, 1, "exp-4")
        .expect_err("no server");

    assert!(matches!(err, HostError::ServerNotFound));
    assert_eq!(host.phase().expect("phase"), MissionPhase::Idle);
    for port in [
        ports.agent_mission_control_port,
        ports.agent_rewards_port,
        ports.agent_observations_port,
    ] {
        assert!(
            StdTcpStream::connect(("127.0.0.1", port)).is_err(),
            "listener on {port} still accepting"
        );
    }
}

#[test]
fn send_command_without_channel_reports_error() {
    let host = tcp_host();

    host.send_command("jump 1").expect("send command");

    let state = host.get_world_state().expect("world state");
    assert_eq!(state.errors.len(), 1);
    assert_eq!(
        state.errors[0].text,
        "commands connection is not open. Is the mission running?"
    );
    assert!(host.get_world_state().expect("world state").errors.is_empty());
}

#[test]
fn calls_from_inside_a_runtime_are_refused() {
    let host = tcp_host();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let result = runtime.block_on(async { host.peek_world_state() });

    assert!(matches!(
        result,
        Err(HostError::Runtime(RuntimeError::NestedRuntime))
    ));
}

#[test]
fn mission_lifecycle_with_recording() {
    let client = FakeClient::start();
    let host = tcp_host();
    let dir = scratch_dir("lifecycle");
    let record = MissionRecordSpec::new()
        .with_destination(&dir)
        .record_commands()
        .record_rewards()
        .record_observations()
        .record_video(20, 400_000);

    start_running_mission(&host, &client, &record, &video_mission(8, 4, 1));

    let accepted = client.accepted().expect("accepted");
    assert_eq!(accepted.connection.agent_address, "127.0.0.1");
    assert_ne!(accepted.connection.agent_mission_control_port, 0);
    assert_ne!(accepted.connection.agent_rewards_port, 0);
    assert_ne!(accepted.connection.agent_observations_port, 0);
    assert_ne!(accepted.connection.agent_video_port, 0);
    assert_eq!(host.to_string(), "AgentHost: active (with mission)");
    assert_eq!(host.recording_directory().expect("dir"), Some(dir.clone()));

    let mut rewards = client.rewards();
    for reward in ["0:1", "0:2", "0:3.5"] {
        rewards.send_text(reward);
    }
    let mut observations = client.observations();
    observations.send_text("{\"step\":1}");
    observations.send_text("{\"step\":2}");
    let mut video = client.video();
    video.send(&video_payload([0.0; 5], &[1; 31]));
    video.send(&video_payload([1.0, 2.0, 3.0, 0.0, 0.0], &[2; 32]));

    let peeked = wait_for_state(&host, |state| {
        state.number_of_rewards_since_last_state == 3
            && state.number_of_observations_since_last_state == 2
            && state.number_of_video_frames_since_last_state == 1
    });
    assert!(peeked.is_mission_running);
    assert!(peeked.has_mission_begun);

    let state = host.get_world_state().expect("world state");
    assert_eq!(state.rewards.len(), 1);
    assert_eq!(state.rewards[0].reward.value(0), Some(6.5));
    assert_eq!(state.observations.len(), 1);
    assert_eq!(state.observations[0].text, "{\"step\":2}");
    assert_eq!(state.video_frames.len(), 1);
    assert_eq!(state.video_frames[0].frame.pose.x, 1.0);
    assert_eq!(state.mission_control_messages.len(), 1);
    assert!(state.errors.is_empty(), "{state}");

    let drained = host.get_world_state().expect("world state");
    assert!(drained.is_mission_running);
    assert_eq!(drained.number_of_rewards_since_last_state, 0);
    assert!(drained.rewards.is_empty());

    host.send_command("move 1").expect("send command");
    host.send_command("turn -0.5").expect("send command");
    assert!(wait_until(WAIT, || client.commands().len() == 2));
    assert_eq!(client.commands(), vec!["move 1", "turn -0.5"]);

    let before = host.mission_init().expect("mission init");
    let err = host
        .start_mission(
            &single_agent_mission(),
            &pool_of(&[client.port()]),
            &MissionRecordSpec::new(),
            0,
            "exp-again",
        )
        .expect_err("already running");
    assert!(matches!(err, HostError::MissionAlreadyRunning));
    assert_eq!(host.mission_init().expect("mission init"), before);

    let mut control = client.mission_control();
    control.send_text(r#"{"MissionEnded":{"status":"ended","human_readable_status":"Mission ended normally"}}"#);
    wait_for_phase(&host, MissionPhase::Ended);

    let state = host.get_world_state().expect("world state");
    assert!(!state.is_mission_running);
    assert!(state.has_mission_begun);
    assert!(state.errors.is_empty(), "{state}");
    assert!(state.rewards.is_empty());
    assert_eq!(state.mission_control_messages.len(), 1);

    host.send_command("move 1").expect("send after end");
    let state = host.get_world_state().expect("world state");
    assert_eq!(state.errors.len(), 1);
    assert_eq!(client.commands().len(), 2);

    let init_json = std::fs::read_to_string(dir.join("mission_init.json")).expect("mission_init.json");
    assert!(init_json.contains("\"MissionInit\""));
    let commands = std::fs::read_to_string(dir.join("commands.txt")).expect("commands.txt");
    let commands: Vec<&str> = commands.lines().collect();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].ends_with(" move 1"));
    assert!(commands[1].ends_with(" turn -0.5"));
    let rewards = std::fs::read_to_string(dir.join("rewards.txt")).expect("rewards.txt");
    assert_eq!(rewards.lines().count(), 3);
    let observations =
        std::fs::read_to_string(dir.join("observations.txt")).expect("observations.txt");
    assert_eq!(observations.lines().count(), 2);
    let raw = std::fs::read(dir.join("video.raw")).expect("video.raw");
    assert_eq!(&raw[..8], b"MHVIDEO1");
    assert_eq!(raw.len(), 20 + 33 + 32);

    drop(host);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn abnormal_end_reports_one_error_and_final_reward() {
    let client = FakeClient::start();
    let host = tcp_host();
    start_running(&host, &client, &MissionRecordSpec::new());
    host.get_world_state().expect("drain");

    let mut control = client.mission_control();
    control.send_text(
        r#"{"MissionEnded":{"status":"mod_crashed","human_readable_status":"server went away","reward":{"values":{"0":5.0}}}}"#,
    );
    wait_for_phase(&host, MissionPhase::Ended);

    let state = host.get_world_state().expect("world state");
    assert!(!state.is_mission_running);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].text, "Mission ended abnormally: server went away");
    assert_eq!(state.rewards.len(), 1);
    assert_eq!(state.rewards[0].reward.value(0), Some(5.0));
    assert_eq!(state.mission_control_messages.len(), 1);
}

#[test]
fn unexpected_control_messages_become_errors() {
    let client = FakeClient::start();
    let host = tcp_host();
    start_running(&host, &client, &MissionRecordSpec::new());
    host.get_world_state().expect("drain");

    let mut control = client.mission_control();
    control.send_text(r#"{"Telemetry":{"tick":4}}"#);
    control.send_text("not a document");
    control.send_text(r#"{"ping":null}"#);
    control.send_text(&client.mission_init_document());
    control.send_text("");

    let state = wait_for_state(&host, |state| state.errors.len() == 4);
    let errors: Vec<&str> = state.errors.iter().map(|e| e.text.as_str()).collect();
    assert!(errors[0].starts_with(
        "Unknown mission control message root node or at wrong time: Telemetry :{\"Telemetry\""
    ));
    assert!(errors[1].starts_with("Error parsing mission control message: "));
    assert!(errors[2].starts_with(
        "Unknown mission control message root node or at wrong time: MissionInit :"
    ));
    assert_eq!(errors[3], "Empty mission control message");
    // Telemetry, Ping and the repeated MissionInit are kept.
    assert_eq!(state.mission_control_messages.len(), 3);
    assert!(state.is_mission_running);
}

#[test]
fn policies_shape_the_world_state() {
    let client = FakeClient::start();
    let host = tcp_host();
    host.set_rewards_policy(RewardsPolicy::KeepAllRewards)
        .expect("rewards policy");
    host.set_observations_policy(ObservationsPolicy::KeepAllObservations)
        .expect("observations policy");
    start_running(&host, &client, &MissionRecordSpec::new());

    let mut rewards = client.rewards();
    rewards.send_text("0:1");
    rewards.send_text("0:2");
    rewards.send_text("oops");
    let mut observations = client.observations();
    observations.send_text("{\"a\":1}");
    observations.send_text("{\"a\":2}");

    let state = wait_for_state(&host, |state| {
        state.number_of_rewards_since_last_state == 2
            && state.number_of_observations_since_last_state == 2
            && state.errors.len() == 1
    });
    assert_eq!(state.rewards.len(), 2);
    assert_eq!(state.observations.len(), 2);
    assert!(state.errors[0]
        .text
        .starts_with("Error parsing Reward message: "));
    assert!(state.errors[0].text.ends_with(": oops"));
}

#[test]
fn close_ends_the_mission_and_allows_a_restart() {
    let client = FakeClient::start();
    let host = tcp_host();
    start_running(&host, &client, &MissionRecordSpec::new());
    let first: Option<MissionInit> = host.mission_init().expect("mission init");
    let mission_control_port = first
        .as_ref()
        .map(|init| init.connection.agent_mission_control_port);

    host.close().expect("close");
    host.close().expect("close twice");
    assert_eq!(host.phase().expect("phase"), MissionPhase::Ended);
    assert!(!host.peek_world_state().expect("peek").is_mission_running);

    host.start_mission(
        &single_agent_mission(),
        &pool_of(&[client.port()]),
        &MissionRecordSpec::new(),
        0,
        "exp-restart",
    )
    .expect("restart");
    let second = host.mission_init().expect("mission init").expect("negotiated");
    assert_eq!(second.experiment_id, "exp-restart");
    assert_eq!(
        Some(second.connection.agent_mission_control_port),
        mission_control_port
    );
}

#[test]
fn busy_client_is_reported_as_unavailable() {
    let client = FakeClient::busy();
    let host = tcp_host();

    let err = host
        .start_mission(
            &single_agent_mission(),
            &ClientPool::from(vec![client.info()]),
            &MissionRecordSpec::new(),
            0,
            "exp",
        )
        .expect_err("busy");

    assert!(matches!(err, HostError::NoAvailableClient));
    assert_eq!(client.requests().len(), 1);
    assert!(client.accepted().is_none());
}
