use std::{fmt::Display, time::Duration};

use thiserror::Error;

/// Failures surfaced by connections and the hub.
///
/// Every variant is local to one connection except [`RelayError::HubClosed`],
/// which means the event loop has stopped and no further events are accepted.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("connection is closed")]
    Closed,

    #[error("hub is no longer running")]
    HubClosed,
}

impl RelayError {
    pub fn transport(err: impl Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Oversized messages are protocol violations rather than I/O failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::MessageTooLarge { .. })
    }
}
