//! Native streaming speech recognition
//!
//! Wraps an incremental recognizer that reports interim and final fragments as
//! the user speaks. Engine callbacks arrive on a channel and are applied one at
//! a time from [`StreamingRecognizer::next_event`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{AdapterEvent, AdapterPhase, Strategy, TranscriptEvent, VoiceAdapter};
use crate::config::Config;
use crate::{Error, Result};

/// Options handed to the engine on start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionOptions {
    /// BCP 47 language tag
    pub language: String,
    pub continuous: bool,
    pub interim_results: bool,
    pub max_alternatives: u32,
}

impl RecognitionOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            language: config.language.clone(),
            continuous: config.recognizer.continuous,
            interim_results: config.recognizer.interim_results,
            max_alternatives: config.recognizer.max_alternatives,
        }
    }
}

/// One candidate transcript
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
}

/// A recognized segment, best alternative first
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub is_final: bool,
    pub alternatives: Vec<Alternative>,
}

/// Results reported by one engine callback
///
/// Entries before `result_index` were already reported and are unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultBatch {
    pub result_index: usize,
    pub results: Vec<RecognitionResult>,
}

/// Callback from the native engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Audio capture began
    Started,
    Result(ResultBatch),
    /// Engine error code (e.g. `"no-speech"`)
    Error(String),
    /// The session is over; nothing further arrives on this channel
    Ended,
}

/// Why the engine refused to start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineStartError {
    /// A previous session is still running inside the engine
    #[error("recognition already started")]
    AlreadyStarted,

    #[error("{0}")]
    Other(String),
}

/// Host speech recognizer
pub trait SpeechEngine: Send {
    /// Whether the host provides a recognizer
    fn is_supported(&self) -> bool;

    /// Begin a session, reporting callbacks on `events`
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot start
    fn start(
        &mut self,
        options: &RecognitionOptions,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> std::result::Result<(), EngineStartError>;

    /// Stop listening and deliver pending results, then [`EngineEvent::Ended`]
    fn stop(&mut self);

    /// Stop immediately, dropping pending results
    fn abort(&mut self);
}

/// Map a native engine error code onto the shared taxonomy
#[must_use]
pub fn map_engine_error(code: &str) -> Error {
    match code {
        "no-speech" => Error::NoSpeechDetected,
        "audio-capture" => Error::DeviceUnavailable("microphone capture failed".to_string()),
        "not-allowed" | "service-not-allowed" => Error::PermissionDenied,
        "network" => Error::NetworkFailure("speech service unreachable".to_string()),
        "aborted" => Error::Aborted,
        "language-not-supported" => Error::LanguageUnsupported,
        "service-unavailable" => Error::ServiceUnavailable,
        other => Error::Unknown(other.to_string()),
    }
}

/// Recognizer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Idle,
    Listening,
    Error,
}

/// Streaming capture strategy
pub struct StreamingRecognizer {
    engine: Box<dyn SpeechEngine>,
    options: RecognitionOptions,
    restart_delay: Duration,
    state: StreamingState,
    events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    transcript: String,
    interim: String,
    queued: VecDeque<AdapterEvent>,
    error: Option<Error>,
    session: Option<Uuid>,
    in_flight: bool,
}

impl StreamingRecognizer {
    #[must_use]
    pub fn new(engine: Box<dyn SpeechEngine>, config: &Config) -> Self {
        Self {
            engine,
            options: RecognitionOptions::from_config(config),
            restart_delay: config.recognizer.restart_delay,
            state: StreamingState::Idle,
            events: None,
            transcript: String::new(),
            interim: String::new(),
            queued: VecDeque::new(),
            error: None,
            session: None,
            in_flight: false,
        }
    }

    /// Whether the host recognizer is usable
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.engine.is_supported()
    }

    #[must_use]
    pub const fn state(&self) -> StreamingState {
        self.state
    }

    /// Accumulated final transcript
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Pending interim text
    #[must_use]
    pub fn interim(&self) -> &str {
        &self.interim
    }

    /// Start listening
    ///
    /// Resolves once the engine acknowledges the start. A no-op while listening.
    ///
    /// # Errors
    ///
    /// Returns error if the engine refuses to start twice or reports an error
    /// before acknowledging
    pub async fn start(&mut self) -> Result<()> {
        self.recover_interrupted();
        if self.state == StreamingState::Listening {
            tracing::debug!("recognizer already listening");
            return Ok(());
        }

        self.in_flight = true;
        let result = self.begin_session().await;
        self.in_flight = false;

        match result {
            Ok(()) => {
                self.state = StreamingState::Listening;
                tracing::info!(session = ?self.session, language = %self.options.language, "listening");
                Ok(())
            }
            Err(e) => {
                self.events = None;
                Err(self.fail(e))
            }
        }
    }

    async fn begin_session(&mut self) -> Result<()> {
        self.transcript.clear();
        self.interim.clear();
        self.queued.clear();
        self.error = None;
        self.session = Some(Uuid::new_v4());

        let (tx, mut rx) = mpsc::unbounded_channel();
        match self.engine.start(&self.options, tx.clone()) {
            Ok(()) => {}
            Err(EngineStartError::AlreadyStarted) => {
                tracing::warn!(delay = ?self.restart_delay, "recognizer already started, retrying");
                self.engine.stop();
                tokio::time::sleep(self.restart_delay).await;
                self.engine
                    .start(&self.options, tx)
                    .map_err(|e| Error::Unknown(e.to_string()))?;
            }
            Err(EngineStartError::Other(message)) => return Err(Error::Unknown(message)),
        }

        loop {
            match rx.recv().await {
                Some(EngineEvent::Started) => break,
                Some(EngineEvent::Result(batch)) => self.apply_batch(&batch),
                Some(EngineEvent::Error(code)) => return Err(map_engine_error(&code)),
                Some(EngineEvent::Ended) | None => return Err(Error::Aborted),
            }
        }

        self.events = Some(rx);
        Ok(())
    }

    /// Ask the engine to finish; [`EngineEvent::Ended`] leaves `Listening`
    pub fn stop(&mut self) {
        self.recover_interrupted();
        if self.state == StreamingState::Listening {
            tracing::debug!(session = ?self.session, "stopping recognizer");
            self.engine.stop();
        }
    }

    /// Terminate immediately, discarding pending results
    pub fn abort(&mut self) {
        self.in_flight = false;
        if self.state == StreamingState::Listening || self.events.is_some() {
            self.engine.abort();
        }
        self.events = None;
        self.queued.clear();
        self.interim.clear();
        self.transcript.clear();
        self.state = StreamingState::Idle;
        tracing::debug!(session = ?self.session, "recognizer aborted");
    }

    /// A start future was dropped before it resolved
    fn recover_interrupted(&mut self) {
        if self.in_flight {
            tracing::warn!("previous recognizer operation interrupted, resetting");
            self.abort();
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        tracing::error!(session = ?self.session, error = %error, "recognition failed");
        self.state = StreamingState::Error;
        self.error = Some(error.clone());
        error
    }

    fn apply(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Started => {}
            EngineEvent::Result(batch) => self.apply_batch(&batch),
            EngineEvent::Error(code) => {
                let error = map_engine_error(&code);
                self.fail(error);
                self.queued.push_back(AdapterEvent::Failed);
            }
            EngineEvent::Ended => {
                self.events = None;
                if !self.interim.is_empty() {
                    self.interim.clear();
                    self.queued.push_back(AdapterEvent::Interim(String::new()));
                }
                if self.state == StreamingState::Listening {
                    self.state = StreamingState::Idle;
                }
                tracing::debug!(session = ?self.session, "recognizer ended");
                self.queued.push_back(AdapterEvent::Stopped);
            }
        }
    }

    /// Append finals and replace the interim from the batch cursor onward
    fn apply_batch(&mut self, batch: &ResultBatch) {
        let mut finals = String::new();
        let mut confidence: Option<f32> = None;
        let mut interim = String::new();

        for result in batch.results.iter().skip(batch.result_index) {
            let Some(best) = result.alternatives.first() else {
                continue;
            };
            if result.is_final {
                finals.push_str(&best.transcript);
                confidence = Some(confidence.map_or(best.confidence, |c| c.min(best.confidence)));
            } else {
                interim.push_str(&best.transcript);
            }
        }

        if !finals.is_empty() {
            self.transcript.push_str(&finals);
            tracing::debug!(session = ?self.session, text = %finals, "final fragment");
            self.queued.push_back(AdapterEvent::Final(TranscriptEvent::new(
                finals,
                true,
                confidence.unwrap_or(0.0),
            )));
        }

        if interim != self.interim {
            self.interim.clone_from(&interim);
            self.queued.push_back(AdapterEvent::Interim(interim));
        }
    }
}

#[async_trait]
impl VoiceAdapter for StreamingRecognizer {
    fn strategy(&self) -> Strategy {
        Strategy::Streaming
    }

    fn phase(&self) -> AdapterPhase {
        match self.state {
            StreamingState::Idle => AdapterPhase::Idle,
            StreamingState::Listening => AdapterPhase::Active,
            StreamingState::Error => AdapterPhase::Error,
        }
    }

    fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    async fn start(&mut self) -> Result<()> {
        Self::start(self).await
    }

    async fn stop(&mut self) -> Result<()> {
        Self::stop(self);
        Ok(())
    }

    async fn cancel(&mut self) {
        self.abort();
    }

    async fn next_event(&mut self) -> AdapterEvent {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return event;
            }

            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };

            match events.recv().await {
                Some(event) => self.apply(event),
                None => self.apply(EngineEvent::Ended),
            }
        }
    }

    fn take_transcript(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }
}
