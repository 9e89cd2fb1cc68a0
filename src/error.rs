//! Error types for the voice core

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing or transcribing speech
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Host lacks the capability required by the selected strategy
    #[error("voice input is not supported on this device")]
    Unsupported,

    /// User declined microphone access
    #[error("microphone permission denied")]
    PermissionDenied,

    /// No usable capture device or encoding
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Recognizer heard nothing
    #[error("no speech detected")]
    NoSpeechDetected,

    /// Network failure reaching a speech service
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// Operation aborted before completion
    #[error("aborted")]
    Aborted,

    /// Remote strategy selected without a credential
    #[error("missing API key for remote transcription")]
    MissingCredential,

    /// Remote transcription service returned a non-success status
    #[error("transcription service error {status}: {message}")]
    RemoteServiceError {
        /// HTTP status code
        status: u16,
        /// Message extracted from the error body
        message: String,
    },

    /// Recognizer does not support the configured language
    #[error("language not supported")]
    LanguageUnsupported,

    /// Recognition service is unavailable
    #[error("speech service unavailable")]
    ServiceUnavailable,

    /// Unmapped engine error code
    #[error("unknown voice error: {0}")]
    Unknown(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Realtime session protocol error
    #[error("realtime error: {0}")]
    Realtime(String),

    /// IO error
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(Arc<toml::de::Error>),
}

impl Error {
    /// Short human-readable status line for the control surface
    #[must_use]
    pub fn status_message(&self) -> String {
        match self {
            Self::Unsupported => "Voice input unavailable".to_string(),
            Self::PermissionDenied => "Microphone access denied".to_string(),
            Self::DeviceUnavailable(_) => "No microphone found".to_string(),
            Self::NoSpeechDetected => "No speech detected, try again".to_string(),
            Self::NetworkFailure(_) => "Network error, check your connection".to_string(),
            Self::Aborted => "Listening stopped".to_string(),
            Self::MissingCredential => "Transcription key missing".to_string(),
            Self::RemoteServiceError { status, .. } => {
                format!("Transcription failed ({status})")
            }
            Self::LanguageUnsupported => "Language not supported".to_string(),
            Self::ServiceUnavailable => "Speech service unavailable".to_string(),
            Self::Realtime(_) => "Voice session interrupted".to_string(),
            Self::Unknown(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Toml(_) => "Voice error, try again".to_string(),
        }
    }

    /// Whether the control stays usable after this error
    ///
    /// Only a missing capability or a refused permission disables the control
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Unsupported | Self::PermissionDenied)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(Arc::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::NetworkFailure(e.to_string())
    }
}
