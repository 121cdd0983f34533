//! Error types for the companion voice pipeline

use thiserror::Error;

/// Result type alias for pipeline construction and hardware operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring the pipeline or driving audio hardware
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Durable storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why `start_recording` refused to open a capture
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Microphone access was refused; the user must grant it externally
    #[error("microphone permission denied")]
    PermissionDenied,

    /// The input device could not be opened
    #[error("capture device error: {0}")]
    Device(String),
}

/// Why a transcription produced no text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptionError {
    /// Provider answered with a non-success status
    #[error("provider error {status}: {body}")]
    Provider {
        /// HTTP status code
        status: u16,
        /// Response body, for logs
        body: String,
    },

    /// Request never produced a response
    #[error("network error: {0}")]
    Network(String),

    /// The timeout won the race against the provider
    #[error("transcription timed out")]
    Timeout,

    /// Response body did not have the expected shape
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl TranscriptionError {
    /// Malformed payloads are reported to the user the same way as provider failures
    #[must_use]
    pub const fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. } | Self::Network(_) | Self::MalformedResponse(_)
        )
    }
}

/// Why `speak` failed to start playback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeakError {
    /// Provider credentials are missing; not retried automatically
    #[error("speech provider not configured: {0}")]
    ConfigurationMissing(String),

    /// Network or provider failure; the caller may retry
    #[error("speech provider error: {0}")]
    Provider(String),

    /// Synthesis did not complete before its deadline
    #[error("speech synthesis timed out")]
    Timeout,

    /// Output device could not start playback
    #[error("playback error: {0}")]
    Playback(String),
}

/// Non-error result of `speak`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Audio is playing
    Playing,
    /// Voice energy is exhausted; nothing was requested from the provider
    QuotaExhausted,
    /// A newer `speak` or `stop` took over before this one reached playback
    Superseded,
}
