use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub const MISSION_INIT_ROOT: &str = "MissionInit";
pub const MISSION_ENDED_ROOT: &str = "MissionEnded";
pub const PING_ROOT: &str = "ping";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty document")]
    Empty,
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("document has {0} root elements, expected one")]
    MultipleRoots(usize),
    #[error("unexpected root element `{0}`")]
    UnexpectedRoot(String),
}

/// Mission-control message classified by its single top-level key.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlDocument {
    MissionInit(Value),
    MissionEnded(Value),
    Ping,
    Other { root: String, body: Value },
}

impl ControlDocument {
    pub fn classify(text: &str) -> Result<Self, DocumentError> {
        if text.trim().is_empty() {
            return Err(DocumentError::Empty);
        }
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(DocumentError::NotAnObject);
        };
        if map.len() > 1 {
            return Err(DocumentError::MultipleRoots(map.len()));
        }
        let Some((root, body)) = map.into_iter().next() else {
            return Err(DocumentError::Empty);
        };
        Ok(match root.as_str() {
            MISSION_INIT_ROOT => Self::MissionInit(body),
            MISSION_ENDED_ROOT => Self::MissionEnded(body),
            PING_ROOT => Self::Ping,
            _ => Self::Other { root, body },
        })
    }

    pub fn root(&self) -> &str {
        match self {
            Self::MissionInit(_) => MISSION_INIT_ROOT,
            Self::MissionEnded(_) => MISSION_ENDED_ROOT,
            Self::Ping => PING_ROOT,
            Self::Other { root, .. } => root,
        }
    }
}

/// Deserializes the body of a classified document into its typed form.
pub fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, DocumentError> {
    Ok(serde_json::from_value(body)?)
}
