//! Error types for the paged KV cache manager.

use thiserror::Error;

use crate::types::SeqId;

#[derive(Error, Debug)]
pub enum Error {
    /// Allocation cannot be satisfied even after maximal eviction. Callers
    /// are expected to shed load: reject the request or release a sequence.
    #[error("Out of KV cache blocks: {0}")]
    OutOfBlocks(String),

    #[error("Unknown sequence id: {0}")]
    UnknownSequence(SeqId),

    /// Misuse of the fetch/step protocol. Programmer error, surfaced as fatal.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A sequence would exceed `max_seq_len`. Callers truncate or release.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Rejected at construction only.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
