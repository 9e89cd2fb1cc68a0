//! Events delivered to the command-interpretation consumer

use serde::{Deserialize, Serialize};

use super::PresentationState;

/// One recognized fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// Engine confidence in `[0, 1]`
    pub confidence: f32,
}

impl TranscriptEvent {
    /// Build an event, clamping confidence into `[0, 1]`
    #[must_use]
    pub fn new(text: impl Into<String>, is_final: bool, confidence: f32) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            text: text.into(),
            is_final,
            confidence,
        }
    }
}

/// A structured edit command emitted by the realtime session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceAction {
    /// Command name (e.g. `"set_client_name"`)
    pub name: String,

    /// Command arguments
    #[serde(default)]
    pub arguments: serde_json::Value,

    /// Service-side call identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Message delivered to the consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// Provisional text for live display
    Interim { text: String },

    /// Finalized utterance, delivered exactly once
    Transcript { text: String },

    /// Completed spoken response text (realtime only)
    Response { text: String },

    /// Ordered batch of edit commands (realtime only)
    Actions { actions: Vec<VoiceAction> },

    /// Presentation state changed
    State { state: PresentationState },

    /// Adapter failure, with a short status line
    Error { message: String, recoverable: bool },
}
