/// Result alias that carries the custom [`PlayerError`] type.
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// Free-form failure that does not fit any of the structured variants.
    #[error("{0}")]
    Message(String),
    /// Caller supplied data the operation cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The track resolver could not produce a playable source.
    #[error("track `{track}` is unavailable")]
    SourceUnavailable { track: String },
    /// The audio output refused to start or to accept a scheduled segment.
    /// This is the only failure surfaced to callers of the transport API.
    #[error("audio graph failure: {0}")]
    AudioGraph(String),
    /// A shared lock was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// The FFT backend rejected the buffers it was handed.
    #[error("fft failure: {0}")]
    Fft(#[from] realfft::FftError),
    /// Settings could not be encoded or decoded.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for [`PlayerError::SourceUnavailable`].
    pub fn unavailable(track: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            track: track.into(),
        }
    }
}

impl From<&str> for PlayerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PlayerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
