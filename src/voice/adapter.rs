//! Common interface implemented by every capture strategy

use async_trait::async_trait;

use super::{Strategy, TranscriptEvent, VoiceAction};
use crate::config::Credential;
use crate::{Error, Result};

/// Coarse phase shared by all adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterPhase {
    /// Ready to start
    Idle,
    /// Listening or recording
    Active,
    /// Transcribing or waiting on a response
    Processing,
    /// Last operation failed; can be restarted
    Error,
}

/// Event produced while an adapter session runs
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Provisional text replaced
    Interim(String),
    /// A final fragment was appended to the transcript accumulator
    Final(TranscriptEvent),
    /// Spoken response text completed
    Response(String),
    /// Batch of structured actions
    Actions(Vec<VoiceAction>),
    /// Waiting on transcription or a response
    Processing,
    /// Processing finished with nothing to deliver
    Completed,
    /// Capture ended
    Stopped,
    /// The session recorded an error; see [`VoiceAdapter::last_error`]
    Failed,
}

/// A capture strategy
///
/// Implementations guard re-entry with an "operation in flight" flag and release
/// the capture device on every exit path.
#[async_trait]
pub trait VoiceAdapter: Send {
    /// Strategy tag
    fn strategy(&self) -> Strategy;

    /// Current coarse phase
    fn phase(&self) -> AdapterPhase;

    /// Most recent error, cleared on the next successful start
    fn last_error(&self) -> Option<&Error>;

    /// Whether a session is live (toggling the control stops it)
    fn is_live(&self) -> bool {
        matches!(self.phase(), AdapterPhase::Active)
    }

    /// Start a session; a no-op while one is live
    async fn start(&mut self) -> Result<()>;

    /// Gracefully stop the live session
    async fn stop(&mut self) -> Result<()>;

    /// Tear down immediately, discarding pending audio and results
    async fn cancel(&mut self);

    /// Wait for the next session event
    ///
    /// Cancel-safe: pending forever while nothing is running.
    async fn next_event(&mut self) -> AdapterEvent;

    /// Take the accumulated final transcript, leaving it empty
    fn take_transcript(&mut self) -> String;

    /// Replace the remote-service credential
    fn set_credential(&mut self, _credential: Option<Credential>) {}
}
