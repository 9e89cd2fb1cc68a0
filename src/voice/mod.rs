//! Voice capture and transcription
//!
//! Three interchangeable capture strategies sit behind [`VoiceAdapter`]:
//! a native streaming recognizer, a buffered recorder that uploads to a remote
//! transcription service, and a realtime conversational session.
//! [`VoiceController`] picks one, drives it, and forwards finalized text to the
//! consumer as [`VoiceEvent`]s.

mod adapter;
mod buffered;
mod capture;
mod controller;
mod events;
mod permission;
mod playback;
mod realtime;
mod streaming;
mod strategy;
mod stt;
pub mod tones;

pub use adapter::{AdapterEvent, AdapterPhase, VoiceAdapter};
pub use buffered::{BufferedRecorder, RecordingState};
pub use capture::{
    AudioBuffer, AudioFormat, AudioSource, CaptureConstraints, CaptureHandle, CpalSource,
    DeviceStream, FORMAT_PREFERENCE, SAMPLE_RATE, negotiate_format, samples_to_wav,
};
pub use controller::{VoiceBackends, VoiceCommand, VoiceController, VoiceHandle};
pub use events::{TranscriptEvent, VoiceAction, VoiceEvent};
pub use permission::{PermissionGate, PermissionState};
pub use playback::{AudioOutput, CpalOutput, PLAYBACK_SAMPLE_RATE};
pub use realtime::{
    ChannelTransport, ClientEvent, RealtimeState, RealtimeTransport, RealtimeVoice, RemoteEnd,
    ServerError, ServerEvent, SessionSettings,
};
pub use streaming::{
    Alternative, EngineEvent, EngineStartError, RecognitionOptions, RecognitionResult,
    ResultBatch, SpeechEngine, StreamingRecognizer, StreamingState, map_engine_error,
};
pub use strategy::{
    Capabilities, Preference, PresentationState, Strategy, derive_presentation, select_strategy,
};
pub use stt::{RemoteTranscriber, Transcriber};
pub use tones::{CueKind, SoundCue, Tone, ToneEngine, Waveform};
