//! TOML configuration file loading
//!
//! Supports `~/.config/quote-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::voice::Preference;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// BCP 47 language tag (e.g. "fr-FR")
    pub language: Option<String>,

    /// Preferred capture strategy ("auto", "streaming", "buffered", "realtime")
    pub preference: Option<Preference>,

    /// API key for the transcription and realtime services
    pub api_key: Option<String>,

    /// Native recognizer options
    #[serde(default)]
    pub recognizer: RecognizerFileConfig,

    /// Microphone capture options
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Remote transcription options
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Realtime conversational session options
    #[serde(default)]
    pub realtime: RealtimeFileConfig,

    /// Feedback tone options
    #[serde(default)]
    pub tones: TonesFileConfig,
}

/// Native recognizer configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognizerFileConfig {
    pub continuous: Option<bool>,
    pub interim_results: Option<bool>,
    pub max_alternatives: Option<u32>,
    /// Delay before retrying an "already started" engine
    pub restart_delay_ms: Option<u64>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Length of each recorded chunk
    pub slice_interval_ms: Option<u64>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub sample_rate: Option<u32>,
}

/// Remote transcription configuration
#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionFileConfig {
    /// API base URL (e.g. `https://api.openai.com/v1`)
    pub base_url: Option<String>,
    /// Model identifier (e.g. "whisper-1")
    pub model: Option<String>,
    /// ISO 639-1 language sent with the upload
    pub language: Option<String>,
    pub temperature: Option<f32>,
    pub response_format: Option<String>,
}

/// Realtime session configuration
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeFileConfig {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

/// Tone configuration
#[derive(Debug, Default, Deserialize)]
pub struct TonesFileConfig {
    pub enabled: Option<bool>,
    /// Master volume multiplier applied to every cue
    pub volume: Option<f32>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> VoiceConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/quote-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("quote-voice").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let file: VoiceConfigFile = toml::from_str(
            r#"
            language = "en-GB"
            preference = "buffered"

            [capture]
            slice_interval_ms = 250

            [transcription]
            model = "whisper-large"
            "#,
        )
        .unwrap();

        assert_eq!(file.language.as_deref(), Some("en-GB"));
        assert_eq!(file.preference, Some(Preference::Buffered));
        assert_eq!(file.capture.slice_interval_ms, Some(250));
        assert_eq!(file.transcription.model.as_deref(), Some("whisper-large"));
        assert!(file.tones.enabled.is_none());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let file = load_config_file(Some(Path::new("/nonexistent/quote-voice.toml")));
        assert!(file.language.is_none());
        assert!(file.api_key.is_none());
    }
}
