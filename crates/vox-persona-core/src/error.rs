use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxError {
    #[error("Config error: {0}")]
    Config(String),

    /// Capture or playback device denied or unavailable.
    #[error("Device error: {0}")]
    Device(String),

    #[error("Channel open error: {0}")]
    ChannelOpen(String),

    /// Malformed inbound audio payload. Never fatal to a session.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Channel runtime error: {0}")]
    ChannelRuntime(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let err = VoxError::ChannelOpen("refused".into());
        assert_eq!(err.to_string(), "Channel open error: refused");
    }
}
