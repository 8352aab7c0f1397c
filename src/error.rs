//! Error types for the listener side

/// Result type alias for listener operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while talking to the station
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed (connect, timeout, body read)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Station answered with a non-success status
    #[error("station returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Playback engine refused an operation
    #[error("playback engine error: {0}")]
    Engine(String),
}

impl ClientError {
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}
