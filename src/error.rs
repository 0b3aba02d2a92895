use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is full! Maximum {0} songs allowed.")]
    QueueFull(usize),

    #[error("Timed out while joining the voice channel")]
    ConnectionTimeout,

    #[error("Failed to join voice channel: {0}")]
    ConnectionFailed(String),

    #[error("Could not resolve a playable stream: {0}")]
    ResolutionFailed(String),

    #[error("Could not start the decoder: {0}")]
    DecoderSpawnFailed(String),

    #[error("Not connected to a voice channel")]
    NotConnected,

    #[error("Playback error: {0}")]
    Playback(String),
}

impl QueueError {
    /// Errors produced while joining a channel, after which the caller's enqueue is rolled back.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, QueueError::ConnectionTimeout | QueueError::ConnectionFailed(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type QueueResult<T> = Result<T, QueueError>;
