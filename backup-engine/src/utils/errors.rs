//! Error types for the backup engine.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("State store error for {item}: {source}")]
    StateStore {
        item: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures talking to the remote transport. All of them are fatal to a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Transport call timed out after {0:?}")]
    Timeout(Duration),
}

/// Why an agent did not produce a usable payload for an item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentFailure {
    #[error("Agent reported failure: {0}")]
    Failed(String),

    #[error("Agent crashed: {0}")]
    Crashed(String),

    #[error("Agent timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),

    #[error("Agent operation cancelled")]
    Cancelled,
}

/// Conditions that end a run early. Remaining items are not attempted.
#[derive(Error, Debug)]
pub enum RunAbort {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Transport initialization returned status {0}")]
    InitializationFailed(i32),

    #[error("Transport reported the destination is not initialized")]
    NotInitialized,

    #[error("Transport returned status {code} for {item}")]
    TransportStatus { item: String, code: i32 },

    #[error("Non-incremental backup of {0} was rejected as requiring non-incremental")]
    ProtocolViolation(String),

    #[error("Metadata backup failed: {0}")]
    MetadataFailed(String),

    #[error("State store failure: {0}")]
    State(#[from] EngineError),

    #[error("Run cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Key {0:?} uses the reserved delimiter range")]
    ReservedKey(String),

    #[error("Truncated entity stream at offset {0}")]
    Truncated(usize),

    #[error("Entity key at offset {0} is not valid UTF-8")]
    InvalidKey(usize),

    #[error("Entity {key:?} is {len} bytes, over the length prefix limit")]
    TooLarge { key: String, len: usize },
}
