use std::time::Duration;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Errors raised while serving connections.
///
/// Everything except `Config` and `Io` is scoped to a single connection and
/// ends only that connection.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Malformed sample: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Connection was evicted from the registry")]
    Evicted,

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<axum::Error> for HubError {
    fn from(err: axum::Error) -> Self {
        HubError::Transport(err.to_string())
    }
}
