//! Error type for the typed signal surface.

use thiserror::Error;

/// Failures surfaced by typed signal reads and writes. Command rejection is
/// ordinary data at the engine level; it becomes an error here only when an
/// operation handle is asked for its outcome.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to serialize signal value: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize signal value: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("operation rejected: {0}")]
    Rejected(String),
}
