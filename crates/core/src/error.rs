/// Result alias that carries the custom [`LightBoardError`] type.
pub type Result<T> = std::result::Result<T, LightBoardError>;

/// Common error type for the core crate.
///
/// Out-of-range configuration is deliberately absent: tunables are clamped,
/// never rejected. Actuator commands have no failure channel either.
#[derive(Debug, thiserror::Error)]
pub enum LightBoardError {
    /// An audio or input source refused access (missing authorization, no
    /// terminal to read keys from, unreadable file).
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The capture device is busy, missing or cannot produce a usable stream.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
    /// Free-form failure, used for poisoned locks and a shut-down engine.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Spectrum computation rejected its buffers.
    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
}

impl LightBoardError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns true for the errors that keep a mode from starting because a
    /// source could not be opened.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::CaptureUnavailable(_)
        )
    }
}

impl From<&str> for LightBoardError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LightBoardError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
