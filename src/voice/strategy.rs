//! Strategy selection and presentation state

use serde::{Deserialize, Serialize};

use super::{AdapterPhase, PermissionState};
use crate::{Error, Result};

/// Caller's declared strategy preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    /// Let the controller choose
    #[default]
    Auto,
    /// Native streaming recognizer
    Streaming,
    /// Record, then upload to the remote service
    Buffered,
    /// Realtime conversational session
    Realtime,
}

impl std::str::FromStr for Preference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "streaming" | "native" => Ok(Self::Streaming),
            "buffered" | "remote" | "whisper" => Ok(Self::Buffered),
            "realtime" => Ok(Self::Realtime),
            other => Err(Error::Config(format!("unknown voice preference: {other}"))),
        }
    }
}

/// Capture strategy backing the control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Streaming,
    Buffered,
    Realtime,
}

/// Which host features are available
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities {
    /// A native streaming recognizer is present and supported
    pub streaming_available: bool,
    /// The host can capture microphone audio into a buffer
    pub buffered_capture_available: bool,
    /// A remote-service credential is configured
    pub remote_key_present: bool,
    /// A realtime transport is present
    pub realtime_available: bool,
}

/// Pick the strategy for a preference and set of capabilities
///
/// Explicit preferences win when their requirements are met; otherwise the
/// automatic policy applies. Streaming is preferred over buffered capture
/// since it has no per-use cost.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if no strategy can run
pub fn select_strategy(preference: Preference, caps: &Capabilities) -> Result<Strategy> {
    let buffered_ready = caps.buffered_capture_available && caps.remote_key_present;

    match preference {
        Preference::Buffered if buffered_ready => return Ok(Strategy::Buffered),
        Preference::Streaming if caps.streaming_available => return Ok(Strategy::Streaming),
        Preference::Realtime
            if caps.realtime_available
                && caps.buffered_capture_available
                && caps.remote_key_present =>
        {
            return Ok(Strategy::Realtime);
        }
        _ => {}
    }

    if caps.streaming_available {
        Ok(Strategy::Streaming)
    } else if buffered_ready {
        Ok(Strategy::Buffered)
    } else {
        Err(Error::Unsupported)
    }
}

/// Unified state shown on the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationState {
    /// No strategy can run; control disabled
    Unsupported,
    /// Microphone refused; control disabled
    PermissionDenied,
    /// Transcribing or waiting on a response
    Processing,
    /// Listening or recording
    Active,
    /// Ready
    Idle,
}

impl PresentationState {
    /// Whether the control accepts clicks
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Unsupported | Self::PermissionDenied)
    }
}

/// Derive the presentation state, highest priority first
#[must_use]
pub fn derive_presentation(
    supported: bool,
    permission: PermissionState,
    phase: Option<AdapterPhase>,
) -> PresentationState {
    if !supported {
        return PresentationState::Unsupported;
    }
    if permission == PermissionState::Denied {
        return PresentationState::PermissionDenied;
    }
    match phase {
        Some(AdapterPhase::Processing) => PresentationState::Processing,
        Some(AdapterPhase::Active) => PresentationState::Active,
        _ => PresentationState::Idle,
    }
}
