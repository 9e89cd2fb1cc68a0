//! Configuration for the voice core
//!
//! The core never reads the environment. Hosts build a [`Config`] from defaults,
//! overlay the optional TOML file, and pass the API key in explicitly.

mod file;

pub use file::{VoiceConfigFile, config_file_path, load_config_file};

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::voice::Preference;

/// Default recognizer and upload language
const DEFAULT_LANGUAGE: &str = "fr-FR";

/// Default OpenAI-compatible API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Resolved voice configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// BCP 47 language tag for recognition
    pub language: String,

    /// Preferred capture strategy
    pub preference: Preference,

    /// Credential for remote services, if any
    pub api_key: Option<Credential>,

    /// Native recognizer options
    pub recognizer: RecognizerConfig,

    /// Microphone capture options
    pub capture: CaptureConfig,

    /// Remote transcription options
    pub transcription: TranscriptionConfig,

    /// Realtime session options
    pub realtime: RealtimeConfig,

    /// Feedback tone options
    pub tones: TonesConfig,
}

/// Opaque API key for the remote services
///
/// Cheap to clone; the secret is never printed.
#[derive(Clone)]
pub struct Credential(Arc<SecretString>);

impl Credential {
    /// Wrap a raw key, rejecting blank strings
    #[must_use]
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return None;
        }
        Some(Self(Arc::new(SecretString::from(key))))
    }

    /// Expose the key for an outgoing request
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Native streaming recognizer options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerConfig {
    /// Keep listening across pauses
    pub continuous: bool,

    /// Report provisional results
    pub interim_results: bool,

    /// Alternatives requested per result
    pub max_alternatives: u32,

    /// Delay before retrying an engine that reported "already started"
    pub restart_delay: Duration,
}

/// Microphone capture options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Length of each delivered chunk
    pub slice_interval: Duration,

    pub echo_cancellation: bool,

    pub noise_suppression: bool,

    /// Capture sample rate in Hz
    pub sample_rate: u32,
}

/// Remote transcription options
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionConfig {
    /// API base URL, without the `/audio/transcriptions` suffix
    pub base_url: String,

    /// Model identifier (e.g. "whisper-1")
    pub model: String,

    /// ISO 639-1 language sent with the upload
    pub language: String,

    /// Sampling temperature; 0 keeps output deterministic
    pub temperature: f32,

    /// Response format requested from the service
    pub response_format: String,
}

/// Realtime session options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub model: String,

    /// Voice used for spoken responses
    pub voice: String,

    /// System instructions sent when the session opens
    pub instructions: Option<String>,
}

/// Feedback tone options
#[derive(Debug, Clone, PartialEq)]
pub struct TonesConfig {
    pub enabled: bool,

    /// Master volume multiplier (0.0 to 1.0)
    pub volume: f32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            interim_results: true,
            max_alternatives: 1,
            restart_delay: Duration::from_millis(150),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            slice_interval: Duration::from_millis(100),
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: 16_000,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            model: "whisper-1".to_string(),
            language: "fr".to_string(),
            temperature: 0.0,
            response_format: "json".to_string(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: None,
        }
    }
}

impl Default for TonesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 1.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            preference: Preference::Auto,
            api_key: None,
            recognizer: RecognizerConfig::default(),
            capture: CaptureConfig::default(),
            transcription: TranscriptionConfig::default(),
            realtime: RealtimeConfig::default(),
            tones: TonesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the TOML file at `path` (or the standard path)
    #[must_use]
    pub fn load(path: Option<&Path>) -> Self {
        Self::from_file(load_config_file(path))
    }

    /// Overlay a parsed config file onto defaults
    #[must_use]
    pub fn from_file(file: VoiceConfigFile) -> Self {
        let defaults = Self::default();

        let recognizer = RecognizerConfig {
            continuous: file
                .recognizer
                .continuous
                .unwrap_or(defaults.recognizer.continuous),
            interim_results: file
                .recognizer
                .interim_results
                .unwrap_or(defaults.recognizer.interim_results),
            max_alternatives: file
                .recognizer
                .max_alternatives
                .unwrap_or(defaults.recognizer.max_alternatives)
                .max(1),
            restart_delay: file
                .recognizer
                .restart_delay_ms
                .map_or(defaults.recognizer.restart_delay, Duration::from_millis),
        };

        let capture = CaptureConfig {
            slice_interval: file
                .capture
                .slice_interval_ms
                .filter(|ms| *ms > 0)
                .map_or(defaults.capture.slice_interval, Duration::from_millis),
            echo_cancellation: file
                .capture
                .echo_cancellation
                .unwrap_or(defaults.capture.echo_cancellation),
            noise_suppression: file
                .capture
                .noise_suppression
                .unwrap_or(defaults.capture.noise_suppression),
            sample_rate: file.capture.sample_rate.unwrap_or(defaults.capture.sample_rate),
        };

        let transcription = TranscriptionConfig {
            base_url: file
                .transcription
                .base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.transcription.base_url),
            model: file.transcription.model.unwrap_or(defaults.transcription.model),
            language: file
                .transcription
                .language
                .unwrap_or(defaults.transcription.language),
            temperature: file
                .transcription
                .temperature
                .unwrap_or(defaults.transcription.temperature),
            response_format: file
                .transcription
                .response_format
                .unwrap_or(defaults.transcription.response_format),
        };

        let realtime = RealtimeConfig {
            model: file.realtime.model.unwrap_or(defaults.realtime.model),
            voice: file.realtime.voice.unwrap_or(defaults.realtime.voice),
            instructions: file.realtime.instructions,
        };

        let tones = TonesConfig {
            enabled: file.tones.enabled.unwrap_or(defaults.tones.enabled),
            volume: file
                .tones
                .volume
                .unwrap_or(defaults.tones.volume)
                .clamp(0.0, 1.0),
        };

        Self {
            language: file.language.unwrap_or(defaults.language),
            preference: file.preference.unwrap_or(defaults.preference),
            api_key: file.api_key.and_then(Credential::new),
            recognizer,
            capture,
            transcription,
            realtime,
            tones,
        }
    }

    /// Replace the credential (empty strings clear it)
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        if let Some(key) = api_key.and_then(Credential::new) {
            self.api_key = Some(key);
        }
        self
    }
}
