//! Negotiation with the pool of candidate clients: reserving clients for a
//! multi-agent mission, locating the shared server and finding a client that
//! accepts the mission.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mission::ServerLocation;

mod transport;

pub use transport::{ReplyTransport, TcpReplyTransport, TransportError};

pub const DEFAULT_CLIENT_PORT: u16 = 10000;

pub const RESERVE_REQUEST_PREFIX: &str = "MALMO_REQUEST_CLIENT:";
pub const CANCEL_REQUEST: &str = "MALMO_CANCEL_REQUEST\n";
pub const FIND_SERVER_PREFIX: &str = "MALMO_FIND_SERVER";
pub const ACCEPTED_TOKEN: &str = "MALMOOK";
pub const SERVER_FOUND_PREFIX: &str = "MALMOS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("malformed reply from client: {0}")]
    MalformedReply(String),
}

/// One candidate client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientInfo {
    pub address: String,
    pub port: u16,
}

impl ClientInfo {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn with_default_port(address: impl Into<String>) -> Self {
        Self::new(address, DEFAULT_CLIENT_PORT)
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl FromStr for ClientInfo {
    type Err = String;

    /// Accepts `host`, `host:port`, `[v6]` or `[v6]:port`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(rest) = value.strip_prefix('[') {
            let (address, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated `[` in `{value}`"))?;
            if address.is_empty() {
                return Err(format!("missing client address in `{value}`"));
            }
            return match tail {
                "" => Ok(Self::with_default_port(address)),
                _ => tail
                    .strip_prefix(':')
                    .and_then(|port| port.parse::<u16>().ok())
                    .map(|port| Self::new(address, port))
                    .ok_or_else(|| format!("invalid client port in `{value}`")),
            };
        }
        match value.rsplit_once(':') {
            Some((address, _)) if address.contains(':') => {
                Err(format!("ipv6 client address must be bracketed in `{value}`"))
            }
            Some((address, port)) if !address.is_empty() => port
                .parse::<u16>()
                .map(|port| Self::new(address, port))
                .map_err(|_| format!("invalid client port in `{value}`")),
            Some(_) => Err(format!("missing client address in `{value}`")),
            None if value.is_empty() => Err("empty client address".to_string()),
            None => Ok(Self::with_default_port(value)),
        }
    }
}

/// Ordered list of candidate clients. Order decides probe order and
/// duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientPool {
    clients: Vec<ClientInfo>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool holding the single local client at `127.0.0.1:10000`.
    pub fn local() -> Self {
        Self::from(vec![ClientInfo::with_default_port("127.0.0.1")])
    }

    pub fn add(&mut self, client: ClientInfo) {
        self.clients.push(client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ClientInfo> {
        self.clients.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients.iter()
    }
}

impl From<Vec<ClientInfo>> for ClientPool {
    fn from(clients: Vec<ClientInfo>) -> Self {
        Self { clients }
    }
}

impl FromIterator<ClientInfo> for ClientPool {
    fn from_iter<I: IntoIterator<Item = ClientInfo>>(iter: I) -> Self {
        Self {
            clients: iter.into_iter().collect(),
        }
    }
}

/// Parameters of a reservation request.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub version: String,
    pub reservation_timeout: Duration,
    pub experiment_id: String,
}

impl ReservationRequest {
    pub fn to_line(&self) -> String {
        format!(
            "{RESERVE_REQUEST_PREFIX}{}:{}:{}\n",
            self.version,
            self.reservation_timeout.as_millis(),
            self.experiment_id
        )
    }
}

pub fn find_server_request(experiment_id: &str) -> String {
    format!("{FIND_SERVER_PREFIX}{experiment_id}\n")
}

/// Runs single exchanges over a [`ReplyTransport`], logging each one and
/// swallowing failures so callers can move on to the next client.
#[derive(Clone, Copy)]
pub struct Prober<'a> {
    transport: &'a dyn ReplyTransport,
    verbose: bool,
}

impl<'a> Prober<'a> {
    pub fn new(transport: &'a dyn ReplyTransport) -> Self {
        Self {
            transport,
            verbose: false,
        }
    }

    /// Raises per-probe request/reply logging from `debug` to `info`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub async fn probe(&self, client: &ClientInfo, request: &str) -> Option<String> {
        let started = Instant::now();
        let request_line = request.trim_end();
        if self.verbose {
            info!(client = %client, request = %request_line, "sending negotiation request");
        } else {
            debug!(client = %client, request = %request_line, "sending negotiation request");
        }

        match self.transport.send_and_await_reply(client, request).await {
            Ok(reply) => {
                metrics::counter!("discovery.probes", "outcome" => "reply").increment(1);
                metrics::histogram!("discovery.probe_latency_ms")
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                if self.verbose {
                    info!(client = %client, reply = %reply, "negotiation reply");
                } else {
                    debug!(client = %client, reply = %reply, "negotiation reply");
                }
                Some(reply)
            }
            Err(err) => {
                metrics::counter!("discovery.probes", "outcome" => "failed").increment(1);
                if self.verbose {
                    info!(client = %client, error = %err, "negotiation probe failed");
                } else {
                    debug!(client = %client, error = %err, "negotiation probe failed");
                }
                None
            }
        }
    }
}

/// Probe order for `find_client`: start at `role mod n` and wrap around.
pub fn probe_order(pool_len: usize, role: usize) -> Vec<usize> {
    (0..pool_len).map(|i| (i + role) % pool_len).collect()
}

/// Parses `MALMOS<address>:<port>`. Replies without the prefix are not a
/// match; replies with it that cannot be decoded are malformed.
pub fn parse_server_reply(reply: &str) -> Result<Option<ServerLocation>, DiscoveryError> {
    let Some(location) = reply.strip_prefix(SERVER_FOUND_PREFIX) else {
        return Ok(None);
    };
    let malformed = || DiscoveryError::MalformedReply(reply.to_string());
    let (address, port) = location.split_once(':').ok_or_else(malformed)?;
    if address.is_empty() {
        return Err(malformed());
    }
    let port = port.trim().parse::<u16>().map_err(|_| malformed())?;
    Ok(Some(ServerLocation {
        address: address.to_string(),
        port,
    }))
}

/// Reserves `required` clients from `pool`, probing in pool order. When the
/// pool runs out first, every client reserved so far is sent a cancellation
/// and the returned pool is empty.
pub async fn reserve_clients(
    prober: &Prober<'_>,
    pool: &ClientPool,
    required: usize,
    request: &ReservationRequest,
) -> ClientPool {
    let mut reserved = ClientPool::new();
    if required == 0 {
        return reserved;
    }
    let line = request.to_line();
    for client in pool.iter() {
        let Some(reply) = prober.probe(client, &line).await else {
            continue;
        };
        if reply.starts_with(ACCEPTED_TOKEN) {
            reserved.add(client.clone());
            if reserved.len() == required {
                metrics::counter!("discovery.reservations", "outcome" => "reserved").increment(1);
                return reserved;
            }
        }
    }

    warn!(
        required,
        reserved = reserved.len(),
        pool = pool.len(),
        "not enough clients available, cancelling reservations"
    );
    metrics::counter!("discovery.reservations", "outcome" => "exhausted").increment(1);
    for client in reserved.iter() {
        if prober.probe(client, CANCEL_REQUEST).await.is_none() {
            warn!(client = %client, "failed to cancel client reservation");
        }
    }
    ClientPool::new()
}

/// Asks each client in pool order where the shared server for
/// `experiment_id` runs. The first affirmative reply wins.
pub async fn find_server(
    prober: &Prober<'_>,
    pool: &ClientPool,
    experiment_id: &str,
) -> Result<Option<ServerLocation>, DiscoveryError> {
    let line = find_server_request(experiment_id);
    for client in pool.iter() {
        let Some(reply) = prober.probe(client, &line).await else {
            continue;
        };
        if let Some(location) = parse_server_reply(&reply)? {
            info!(
                client = %client,
                server_address = %location.address,
                server_port = location.port,
                "found mission server"
            );
            return Ok(Some(location));
        }
    }
    Ok(None)
}

/// Offers the mission to each client in [`probe_order`], stopping at the
/// first exact `MALMOOK`. `build_request` produces the payload for a
/// candidate and may record the candidate in the negotiation record.
pub async fn find_client<F, E>(
    prober: &Prober<'_>,
    pool: &ClientPool,
    role: usize,
    mut build_request: F,
) -> Result<Option<ClientInfo>, E>
where
    F: FnMut(&ClientInfo) -> Result<String, E>,
{
    for index in probe_order(pool.len(), role) {
        let Some(client) = pool.get(index) else {
            continue;
        };
        let request = build_request(client)?;
        let Some(reply) = prober.probe(client, &request).await else {
            continue;
        };
        if reply == ACCEPTED_TOKEN {
            info!(client = %client, role, "client accepted mission");
            return Ok(Some(client.clone()));
        }
    }
    Ok(None)
}
