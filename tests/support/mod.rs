#![allow(dead_code)]

use std::{
    io::{BufRead, BufReader, Write},
    net::{Shutdown, TcpListener, TcpStream},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::Value;

use mission_host::discovery::{ClientInfo, ReplyTransport, TransportError};
use mission_host::mission::{AgentSection, MissionInit, MissionSpec, VideoRequest};
use mission_host::HostConfig;

type Script = dyn Fn(&ClientInfo, &str) -> Option<String> + Send + Sync;

/// Transport that answers from a script instead of the network. `None` from
/// the script behaves like an unreachable client.
pub struct ScriptedTransport {
    script: Box<Script>,
    requests: Mutex<Vec<(ClientInfo, String)>>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&ClientInfo, &str) -> Option<String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every client answers `reply` to everything.
    pub fn replying(reply: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Some(reply.to_string()))
    }

    pub fn requests(&self) -> Vec<(ClientInfo, String)> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn ports_probed(&self) -> Vec<u16> {
        self.requests()
            .into_iter()
            .map(|(client, _)| client.port)
            .collect()
    }

    pub fn requests_to(&self, port: u16) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|(client, _)| client.port == port)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl ReplyTransport for ScriptedTransport {
    async fn send_and_await_reply(
        &self,
        client: &ClientInfo,
        payload: &str,
    ) -> Result<String, TransportError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((client.clone(), payload.to_string()));
        (self.script)(client, payload).ok_or_else(|| TransportError::Connect {
            client: client.to_string(),
            reason: "connection refused".into(),
        })
    }
}

pub fn pool_of(ports: &[u16]) -> mission_host::ClientPool {
    ports
        .iter()
        .map(|port| ClientInfo::new("127.0.0.1", *port))
        .collect()
}

pub fn test_config() -> HostConfig {
    HostConfig {
        listen_address: [127, 0, 0, 1].into(),
        advertised_address: "127.0.0.1".into(),
        probe_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(2),
        worker_threads: 2,
        ..HostConfig::default()
    }
}

pub fn single_agent_mission() -> MissionSpec {
    MissionSpec::new(vec![AgentSection::new("solo")])
}

pub fn video_mission(width: u16, height: u16, channels: u8) -> MissionSpec {
    MissionSpec::new(vec![
        AgentSection::new("solo").with_video(VideoRequest::new(width, height, channels))
    ])
}

pub fn two_agent_mission() -> MissionSpec {
    MissionSpec::new(vec![AgentSection::new("first"), AgentSection::new("second")])
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("mission-host-{name}-{}-{nanos}", std::process::id()))
}

/// Polls `check` until it returns true or `limit` passes.
pub fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// Blocking writer of length-prefixed frames over one connection, so frames
/// arrive in the order they are written.
pub struct FrameWriter {
    stream: TcpStream,
}

impl FrameWriter {
    pub fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to listener");
        stream.set_nodelay(true).expect("nodelay");
        Self { stream }
    }

    pub fn send(&mut self, payload: &[u8]) {
        let len = u32::try_from(payload.len()).expect("frame length");
        self.stream
            .write_all(&len.to_be_bytes())
            .expect("write frame length");
        self.stream.write_all(payload).expect("write frame");
        self.stream.flush().expect("flush frame");
    }

    pub fn send_text(&mut self, text: &str) {
        self.send(text.as_bytes());
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Builds a video frame: big-endian pose header followed by `pixels`.
pub fn video_payload(pose: [f32; 5], pixels: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(20 + pixels.len());
    for value in pose {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload.extend_from_slice(pixels);
    payload
}

/// Stand-in for a remote simulation client: answers negotiation probes on
/// its own port, remembers the mission it accepted and collects commands on a
/// second port.
pub struct FakeClient {
    port: u16,
    commands_port: u16,
    accept_missions: bool,
    requests: Arc<Mutex<Vec<String>>>,
    accepted: Arc<Mutex<Option<MissionInit>>>,
    commands: Arc<Mutex<Vec<String>>>,
    shutdown: Arc<AtomicBool>,
}

impl FakeClient {
    pub fn start() -> Self {
        Self::with_acceptance(true)
    }

    pub fn busy() -> Self {
        Self::with_acceptance(false)
    }

    fn with_acceptance(accept_missions: bool) -> Self {
        let negotiation = TcpListener::bind("127.0.0.1:0").expect("bind negotiation port");
        let commands_listener = TcpListener::bind("127.0.0.1:0").expect("bind commands port");
        let port = negotiation.local_addr().expect("addr").port();
        let commands_port = commands_listener.local_addr().expect("addr").port();

        let client = Self {
            port,
            commands_port,
            accept_missions,
            requests: Arc::new(Mutex::new(Vec::new())),
            accepted: Arc::new(Mutex::new(None)),
            commands: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        {
            let requests = client.requests.clone();
            let accepted = client.accepted.clone();
            let shutdown = client.shutdown.clone();
            thread::spawn(move || {
                for stream in negotiation.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    answer_probe(stream, accept_missions, &requests, &accepted);
                }
            });
        }

        {
            let commands = client.commands.clone();
            let shutdown = client.shutdown.clone();
            thread::spawn(move || {
                for stream in commands_listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let commands = commands.clone();
                    thread::spawn(move || {
                        for line in BufReader::new(stream).lines() {
                            let Ok(line) = line else { break };
                            commands.lock().expect("commands lock").push(line);
                        }
                    });
                }
            });
        }

        client
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo::new("127.0.0.1", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn accepted(&self) -> Option<MissionInit> {
        self.accepted.lock().expect("accepted lock").clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    /// The `MissionInit` document this client sends once its mission starts.
    pub fn mission_init_document(&self) -> String {
        let mut init = self.accepted().expect("no mission accepted yet");
        init.connection.client_address = "127.0.0.1".into();
        init.connection.client_commands_port = self.commands_port;
        init.to_document().expect("encode mission init")
    }

    /// Opens the agent's mission-control listener.
    pub fn mission_control(&self) -> FrameWriter {
        let init = self.accepted().expect("no mission accepted yet");
        FrameWriter::connect(init.connection.agent_mission_control_port)
    }

    pub fn rewards(&self) -> FrameWriter {
        let init = self.accepted().expect("no mission accepted yet");
        FrameWriter::connect(init.connection.agent_rewards_port)
    }

    pub fn observations(&self) -> FrameWriter {
        let init = self.accepted().expect("no mission accepted yet");
        FrameWriter::connect(init.connection.agent_observations_port)
    }

    pub fn video(&self) -> FrameWriter {
        let init = self.accepted().expect("no mission accepted yet");
        FrameWriter::connect(init.connection.agent_video_port)
    }
}

impl Drop for FakeClient {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake both accept loops so they observe the flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        let _ = TcpStream::connect(("127.0.0.1", self.commands_port));
    }
}

fn answer_probe(
    stream: TcpStream,
    accept_missions: bool,
    requests: &Mutex<Vec<String>>,
    accepted: &Mutex<Option<MissionInit>>,
) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(stream) => stream,
        Err(_) => return,
    });
    let mut request = String::new();
    if reader.read_line(&mut request).is_err() {
        return;
    }
    let request = request.trim_end().to_string();
    requests.lock().expect("requests lock").push(request.clone());

    let reply = match serde_json::from_str::<Value>(&request) {
        Ok(Value::Object(mut root)) if root.contains_key("MissionInit") => {
            if accept_missions {
                let body = root.remove("MissionInit").unwrap_or(Value::Null);
                let init: MissionInit = serde_json::from_value(body).expect("mission init body");
                *accepted.lock().expect("accepted lock") = Some(init);
                "MALMOOK"
            } else {
                "MALMOBUSY"
            }
        }
        _ => "MALMOERRORUnknown request",
    };
    let mut stream = stream;
    let _ = stream.write_all(format!("{reply}\n").as_bytes());
    let _ = stream.flush();
}
