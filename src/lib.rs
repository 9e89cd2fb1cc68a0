//! Quote Voice - dual-mode voice capture and transcription core
//!
//! Drives the single voice control of the quoting app:
//! - Native streaming recognition with interim results
//! - Buffered recording uploaded to a remote transcription service
//! - A realtime conversational session emitting structured actions
//! - Feedback tones at capture transitions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Voice control                       │
//! │   activate  │  cancel  │  preference  │  credential  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                VoiceController                       │
//! │   Strategy selection  │  Permission  │  Tones        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  VoiceAdapter                        │
//! │   Streaming  │  Buffered + remote STT  │  Realtime   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod voice;

pub use config::{Config, Credential};
pub use error::{Error, Result};
pub use voice::{
    Preference, PresentationState, Strategy, VoiceBackends, VoiceController, VoiceEvent,
    VoiceHandle,
};
