//! Error types for IndexSync Agent

use indexsync_core::CodecError;
use indexsync_metadata::{AgentId, MetadataError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent not started")]
    NotStarted,

    #[error("Agent already started")]
    AlreadyStarted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Static sharding configuration disagrees with live peers
    #[error("Cluster descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// Own membership row disappeared (pruned by a peer after a long pause)
    #[error("Identity lost: agent {0} is no longer registered")]
    IdentityLost(AgentId),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Apply callback failed; the event is retried later
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AgentError {
    /// Whether the next loop iteration may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Metadata(e) => e.is_transient(),
            AgentError::IdentityLost(_) | AgentError::Handler(_) => true,
            _ => false,
        }
    }
}
