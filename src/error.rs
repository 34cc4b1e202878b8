//! Error types for the wakelink client

use thiserror::Error;

/// Result type alias for wakelink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice client
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone authorization refused (denied or blocked)
    #[error("permission error: {0}")]
    Permission(String),

    /// Audio device could not be acquired or driven
    #[error("device error: {0}")]
    Device(String),

    /// Speech recognition engine failed to initialize
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Remote link failed, closed, or is not open
    #[error("connection error: {0}")]
    Connection(String),

    /// Response audio could not be decoded or played
    #[error("playback error: {0}")]
    Playback(String),

    /// Audio encoding or resampling error
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The session coordinator is no longer running
    #[error("session coordinator stopped")]
    CoordinatorStopped,
}

/// Coarse classification used to pick the resulting session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-actionable, never retried automatically
    Permission,
    /// Operation aborted, no automatic retry
    Device,
    /// Wake word disabled, rest of the client keeps working
    ModelLoad,
    /// Surfaced as `Disconnected`, explicit reconnect required
    Connection,
    /// Reported, next session unaffected
    Playback,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Permission(_) => ErrorKind::Permission,
            Self::Device(_) => ErrorKind::Device,
            Self::ModelLoad(_) => ErrorKind::ModelLoad,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Playback(_) => ErrorKind::Playback,
            Self::Audio(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Toml(_)
            | Self::CoordinatorStopped => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(Error::Device("busy".into()).kind(), ErrorKind::Device);
        assert_eq!(
            Error::Connection("closed".into()).kind(),
            ErrorKind::Connection
        );
        let io = std::io::Error::other("boom");
        assert_eq!(Error::from(io).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_display() {
        let err = Error::ModelLoad("model-en missing".to_string());
        assert_eq!(err.to_string(), "model load error: model-en missing");
    }
}
