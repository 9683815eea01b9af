use std::env;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::PROTOCOL_VERSION;

const DEFAULT_WORKER_THREADS: usize = 1;
const DEFAULT_RESERVATION_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} must be valid unicode")]
    NotUnicode { key: &'static str },
}

/// Runtime settings for an [`crate::AgentHost`].
#[derive(Clone, Debug, PartialEq)]
pub struct HostConfig {
    /// Worker threads of the background execution context, at least one.
    pub worker_threads: usize,
    /// Reservation expiry sent to clients with `MALMO_REQUEST_CLIENT`.
    pub reservation_timeout: Duration,
    /// Bound on one negotiation request/reply exchange.
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub max_frame_bytes: usize,
    pub listen_address: IpAddr,
    /// Address the remote client uses to reach our listeners.
    pub advertised_address: String,
    pub debug_negotiation: bool,
    pub protocol_version: String,
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            reservation_timeout: Duration::from_millis(DEFAULT_RESERVATION_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            listen_address: IpAddr::from([0, 0, 0, 0]),
            advertised_address: "127.0.0.1".to_string(),
            debug_negotiation: false,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Builds a configuration from `MISSION_HOST_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key))
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Result<String, env::VarError>,
    {
        let mut config = Self::new();
        let read = |key: &'static str| -> Result<Option<String>, ConfigError> {
            match lookup(key) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode { key }),
            }
        };

        if let Some(value) = read("MISSION_HOST_WORKER_THREADS")? {
            config.worker_threads = parse_value::<usize>("MISSION_HOST_WORKER_THREADS", &value)?.max(1);
        }
        if let Some(value) = read("MISSION_HOST_RESERVATION_TIMEOUT_MS")? {
            config.reservation_timeout = Duration::from_millis(parse_value(
                "MISSION_HOST_RESERVATION_TIMEOUT_MS",
                &value,
            )?);
        }
        if let Some(value) = read("MISSION_HOST_PROBE_TIMEOUT_MS")? {
            config.probe_timeout =
                Duration::from_millis(parse_value("MISSION_HOST_PROBE_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = read("MISSION_HOST_COMMAND_TIMEOUT_MS")? {
            config.command_timeout =
                Duration::from_millis(parse_value("MISSION_HOST_COMMAND_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = read("MISSION_HOST_MAX_FRAME_BYTES")? {
            let parsed: usize = parse_value("MISSION_HOST_MAX_FRAME_BYTES", &value)?;
            if parsed == 0 {
                return Err(ConfigError::Invalid {
                    key: "MISSION_HOST_MAX_FRAME_BYTES",
                    value,
                });
            }
            config.max_frame_bytes = parsed;
        }
        if let Some(value) = read("MISSION_HOST_LISTEN_ADDRESS")? {
            config.listen_address = parse_value("MISSION_HOST_LISTEN_ADDRESS", &value)?;
        }
        if let Some(value) = read("MISSION_HOST_ADVERTISED_ADDRESS")? {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "MISSION_HOST_ADVERTISED_ADDRESS",
                    value,
                });
            }
            config.advertised_address = trimmed.to_string();
        }
        if let Some(value) = read("MISSION_HOST_DEBUG_NEGOTIATION")? {
            config.debug_negotiation = parse_flag("MISSION_HOST_DEBUG_NEGOTIATION", &value)?;
        }
        if let Some(value) = read("MISSION_HOST_PROTOCOL_VERSION")? {
            config.protocol_version = value.trim().to_string();
        }
        Ok(config)
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}
