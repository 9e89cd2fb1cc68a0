//! Realtime conversational voice session
//!
//! A persistent bidirectional session with the speech service: microphone PCM
//! goes up as base64 frames, and user transcripts, spoken responses, and
//! structured actions come back. Turns are taken manually: stopping capture
//! commits the audio buffer and asks for a response.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    AdapterEvent, AdapterPhase, AudioFormat, AudioOutput, AudioSource, CaptureConstraints,
    CaptureHandle, PLAYBACK_SAMPLE_RATE, Strategy, TranscriptEvent, VoiceAction, VoiceAdapter,
};
use crate::config::{Config, Credential, RealtimeConfig};
use crate::{Error, Result};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeState {
    Disconnected,
    /// Session open, microphone idle
    Connected,
    Listening,
    /// Utterance committed, waiting on the response
    Processing,
    /// Response audio is playing
    Speaking,
}

/// Input transcription model for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTranscription {
    pub model: String,
}

/// Session configuration sent on connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: Option<InputTranscription>,
    /// `None` disables server-side turn detection
    pub turn_detection: Option<serde_json::Value>,
    /// Function schemas the service may call as actions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
}

impl SessionSettings {
    #[must_use]
    pub fn new(config: &RealtimeConfig, transcription_model: &str) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(InputTranscription {
                model: transcription_model.to_string(),
            }),
            turn_detection: None,
            tools: Vec::new(),
        }
    }

    /// Register action schemas
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }
}

/// Event sent to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    /// Base64 PCM16 audio
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    CommitAudio,

    #[serde(rename = "response.create")]
    CreateResponse,
}

/// Error payload from the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Event received from the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta { delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { transcript: String },

    /// Base64 PCM16 response audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    #[serde(rename = "response.text.done")]
    TextDone { text: String },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        name: String,
        /// JSON-encoded arguments
        arguments: String,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error { error: ServerError },

    #[serde(other)]
    Unknown,
}

/// Connection to the realtime service
#[async_trait]
pub trait RealtimeTransport: Send {
    /// Open the connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn connect(&mut self, credential: &Credential, model: &str) -> Result<()>;

    /// Send one event
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed
    async fn send(&mut self, event: &ClientEvent) -> Result<()>;

    /// Receive the next event; `None` once the connection is closed
    ///
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<ServerEvent>>;

    /// Close the connection
    async fn close(&mut self);
}

/// In-process transport whose socket is owned by the host
///
/// Events are exchanged as JSON text frames with the paired [`RemoteEnd`].
pub struct ChannelTransport {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
    open: bool,
}

/// Host side of a [`ChannelTransport`]
pub struct RemoteEnd {
    /// Frames sent by the session
    pub outgoing: mpsc::UnboundedReceiver<String>,
    /// Frames delivered to the session
    pub incoming: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Create a transport and its host side
    #[must_use]
    pub fn pair() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: out_tx,
                incoming: in_rx,
                open: false,
            },
            RemoteEnd {
                outgoing: out_rx,
                incoming: in_tx,
            },
        )
    }
}

#[async_trait]
impl RealtimeTransport for ChannelTransport {
    async fn connect(&mut self, _credential: &Credential, model: &str) -> Result<()> {
        if self.outgoing.is_closed() {
            return Err(Error::Realtime("host socket closed".to_string()));
        }
        self.open = true;
        tracing::debug!(model, "realtime channel open");
        Ok(())
    }

    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        if !self.open {
            return Err(Error::Realtime("not connected".to_string()));
        }
        let frame = serde_json::to_string(event)?;
        self.outgoing
            .send(frame)
            .map_err(|_| Error::Realtime("host socket closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerEvent>> {
        if !self.open {
            return None;
        }
        let frame = self.incoming.recv().await?;
        Some(serde_json::from_str(&frame).map_err(Error::from))
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

impl RemoteEnd {
    /// Next event sent by the session
    pub async fn recv(&mut self) -> Option<Result<ClientEvent>> {
        let frame = self.outgoing.recv().await?;
        Some(serde_json::from_str(&frame).map_err(Error::from))
    }

    /// Deliver an event to the session
    ///
    /// # Errors
    ///
    /// Returns error if the session side was dropped
    pub fn send(&self, event: &ServerEvent) -> Result<()> {
        let frame = serde_json::to_string(event)?;
        self.incoming
            .send(frame)
            .map_err(|_| Error::Realtime("session dropped".to_string()))
    }
}

struct LiveCapture {
    handle: CaptureHandle,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Realtime conversational strategy
pub struct RealtimeVoice {
    transport: Box<dyn RealtimeTransport>,
    source: Arc<dyn AudioSource>,
    output: Option<Arc<dyn AudioOutput>>,
    credential: Option<Credential>,
    model: String,
    settings: SessionSettings,
    constraints: CaptureConstraints,
    slice: Duration,
    state: RealtimeState,
    capture: Option<LiveCapture>,
    interim: String,
    transcript: String,
    actions: Vec<VoiceAction>,
    queued: VecDeque<AdapterEvent>,
    error: Option<Error>,
    session: Option<Uuid>,
    in_flight: bool,
}

impl RealtimeVoice {
    #[must_use]
    pub fn new(
        transport: Box<dyn RealtimeTransport>,
        source: Arc<dyn AudioSource>,
        output: Option<Arc<dyn AudioOutput>>,
        config: &Config,
    ) -> Self {
        let constraints = CaptureConstraints {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            ..CaptureConstraints::from(&config.capture)
        };
        Self {
            transport,
            source,
            output,
            credential: config.api_key.clone(),
            model: config.realtime.model.clone(),
            settings: SessionSettings::new(&config.realtime, &config.transcription.model),
            constraints,
            slice: config.capture.slice_interval,
            state: RealtimeState::Disconnected,
            capture: None,
            interim: String::new(),
            transcript: String::new(),
            actions: Vec::new(),
            queued: VecDeque::new(),
            error: None,
            session: None,
            in_flight: false,
        }
    }

    /// Replace the session configuration used on the next connect
    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub const fn state(&self) -> RealtimeState {
        self.state
    }

    /// Open the session and wait for it to accept the configuration
    ///
    /// # Errors
    ///
    /// Returns error without a credential, or if the session is refused
    pub async fn connect(&mut self) -> Result<()> {
        self.recover_interrupted().await;
        if self.state != RealtimeState::Disconnected {
            return Ok(());
        }
        let Some(credential) = self.credential.clone() else {
            return Err(self.fail(Error::MissingCredential));
        };

        self.error = None;
        self.session = Some(Uuid::new_v4());

        self.in_flight = true;
        let result = self.handshake(&credential).await;
        self.in_flight = false;

        match result {
            Ok(()) => {
                self.state = RealtimeState::Connected;
                tracing::info!(session = ?self.session, model = %self.model, "realtime session connected");
                Ok(())
            }
            Err(e) => {
                self.transport.close().await;
                Err(self.fail(e))
            }
        }
    }

    async fn handshake(&mut self, credential: &Credential) -> Result<()> {
        self.transport.connect(credential, &self.model).await?;
        self.transport
            .send(&ClientEvent::SessionUpdate {
                session: self.settings.clone(),
            })
            .await?;

        loop {
            match self.transport.recv().await {
                Some(Ok(ServerEvent::SessionUpdated)) => return Ok(()),
                Some(Ok(ServerEvent::Error { error })) => {
                    return Err(Error::Realtime(error.message));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => tracing::warn!(error = %e, "dropping malformed realtime frame"),
                None => return Err(Error::Realtime("session closed during handshake".to_string())),
            }
        }
    }

    /// Start streaming microphone audio, connecting first if needed
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot connect or the microphone cannot be
    /// acquired
    pub async fn start_listening(&mut self) -> Result<()> {
        if self.state == RealtimeState::Disconnected {
            self.connect().await?;
        }
        self.recover_interrupted().await;
        if self.capture.is_some() {
            return Ok(());
        }

        self.in_flight = true;
        let result = open_pcm_capture(self.source.as_ref(), &self.constraints, self.slice).await;
        self.in_flight = false;

        match result {
            Ok(capture) => {
                self.capture = Some(capture);
                self.interim.clear();
                self.state = RealtimeState::Listening;
                tracing::debug!(session = ?self.session, "realtime listening");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop capture and ask for a response to the committed utterance
    ///
    /// # Errors
    ///
    /// Returns error if the commit cannot be sent
    pub async fn stop_listening(&mut self) -> Result<()> {
        self.recover_interrupted().await;
        let Some(LiveCapture {
            mut handle,
            mut receiver,
        }) = self.capture.take()
        else {
            return Ok(());
        };

        let finished = handle.finish();
        handle.release();
        if let Err(e) = finished {
            tracing::warn!(error = %e, "failed to flush final audio chunk");
        }

        self.in_flight = true;
        let result = self.commit_turn(&mut receiver).await;
        self.in_flight = false;

        match result {
            Ok(()) => {
                self.state = RealtimeState::Processing;
                self.queued.push_back(AdapterEvent::Stopped);
                self.queued.push_back(AdapterEvent::Processing);
                Ok(())
            }
            Err(e) => {
                // The turn cannot be committed over a broken session
                self.transport.close().await;
                self.state = RealtimeState::Disconnected;
                self.actions.clear();
                Err(self.fail(e))
            }
        }
    }

    async fn commit_turn(&mut self, remaining: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Result<()> {
        while let Ok(chunk) = remaining.try_recv() {
            self.send_audio(&chunk).await?;
        }
        self.transport.send(&ClientEvent::CommitAudio).await?;
        self.transport.send(&ClientEvent::CreateResponse).await
    }

    /// Close the session; safe from any state
    pub async fn disconnect(&mut self) {
        self.in_flight = false;
        if let Some(capture) = self.capture.take() {
            capture.handle.release();
        }
        if self.state != RealtimeState::Disconnected {
            self.transport.close().await;
            tracing::info!(session = ?self.session, "realtime session disconnected");
        }
        self.state = RealtimeState::Disconnected;
        self.interim.clear();
        self.actions.clear();
        self.queued.clear();
    }

    async fn send_audio(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let audio = base64::engine::general_purpose::STANDARD.encode(chunk);
        self.transport.send(&ClientEvent::AppendAudio { audio }).await
    }

    async fn recover_interrupted(&mut self) {
        if self.in_flight {
            tracing::warn!("previous realtime operation interrupted, disconnecting");
            self.disconnect().await;
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        tracing::error!(session = ?self.session, error = %error, "realtime session failed");
        self.error = Some(error.clone());
        error
    }

    fn apply(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::TranscriptionDelta { delta } => {
                self.interim.push_str(&delta);
                self.queued
                    .push_back(AdapterEvent::Interim(self.interim.clone()));
            }
            ServerEvent::TranscriptionCompleted { transcript } => {
                self.interim.clear();
                let text = transcript.trim();
                if !text.is_empty() {
                    self.transcript.push_str(text);
                    self.queued
                        .push_back(AdapterEvent::Final(TranscriptEvent::new(text, true, 1.0)));
                }
            }
            ServerEvent::AudioDelta { delta } => {
                if self.state == RealtimeState::Processing {
                    self.state = RealtimeState::Speaking;
                }
                self.play_audio(&delta);
            }
            ServerEvent::AudioTranscriptDone { transcript: text } | ServerEvent::TextDone { text } => {
                if !text.is_empty() {
                    self.queued.push_back(AdapterEvent::Response(text));
                }
            }
            ServerEvent::FunctionCallDone {
                name,
                arguments,
                call_id,
            } => {
                let arguments = serde_json::from_str(&arguments).unwrap_or_else(|e| {
                    tracing::warn!(action = %name, error = %e, "action arguments are not JSON");
                    serde_json::Value::String(arguments)
                });
                self.actions.push(VoiceAction {
                    name,
                    arguments,
                    call_id,
                });
            }
            ServerEvent::ResponseDone => {
                if !self.actions.is_empty() {
                    let actions = std::mem::take(&mut self.actions);
                    tracing::debug!(session = ?self.session, count = actions.len(), "action batch");
                    self.queued.push_back(AdapterEvent::Actions(actions));
                }
                if matches!(
                    self.state,
                    RealtimeState::Processing | RealtimeState::Speaking
                ) {
                    self.state = RealtimeState::Connected;
                }
                self.queued.push_back(AdapterEvent::Completed);
            }
            ServerEvent::Error { error } => {
                if matches!(
                    self.state,
                    RealtimeState::Processing | RealtimeState::Speaking
                ) {
                    self.state = RealtimeState::Connected;
                }
                self.fail(Error::Realtime(error.message));
                self.queued.push_back(AdapterEvent::Failed);
            }
            ServerEvent::SpeechStarted | ServerEvent::SpeechStopped => {
                tracing::trace!(session = ?self.session, ?event, "speech boundary");
            }
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated | ServerEvent::Unknown => {}
        }
    }

    fn play_audio(&self, delta: &str) {
        let Some(output) = self.output.as_ref() else {
            return;
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(delta) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "invalid response audio frame");
                return;
            }
        };
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / f32::from(i16::MAX))
            .collect();
        if let Err(e) = output.enqueue(samples) {
            tracing::warn!(error = %e, "failed to play response audio");
        }
    }

    /// The connection dropped from the far side
    fn connection_lost(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.handle.release();
        }
        self.state = RealtimeState::Disconnected;
        self.actions.clear();
        self.fail(Error::Realtime("session closed".to_string()));
        self.queued.push_back(AdapterEvent::Failed);
    }
}

async fn open_pcm_capture(
    source: &dyn AudioSource,
    constraints: &CaptureConstraints,
    slice: Duration,
) -> Result<LiveCapture> {
    if !source.supports_format(&AudioFormat::PCM16) {
        return Err(Error::DeviceUnavailable(
            "raw PCM capture not supported".to_string(),
        ));
    }
    let stream = source.acquire(constraints).await?;
    let mut handle = CaptureHandle::new(stream);
    let (sender, receiver) = mpsc::unbounded_channel();
    handle.start(AudioFormat::PCM16, slice, sender)?;
    Ok(LiveCapture { handle, receiver })
}

async fn next_chunk(capture: &mut Option<LiveCapture>) -> Option<Vec<u8>> {
    match capture {
        Some(capture) => capture.receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl VoiceAdapter for RealtimeVoice {
    fn strategy(&self) -> Strategy {
        Strategy::Realtime
    }

    fn phase(&self) -> AdapterPhase {
        match self.state {
            RealtimeState::Disconnected | RealtimeState::Connected => AdapterPhase::Idle,
            RealtimeState::Listening => AdapterPhase::Active,
            RealtimeState::Processing | RealtimeState::Speaking => AdapterPhase::Processing,
        }
    }

    fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    async fn start(&mut self) -> Result<()> {
        self.start_listening().await
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop_listening().await
    }

    async fn cancel(&mut self) {
        self.disconnect().await;
    }

    /// A chunk taken from capture is sent before returning; dropping this
    /// future mid-send loses that chunk.
    async fn next_event(&mut self) -> AdapterEvent {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return event;
            }

            let connected = self.state != RealtimeState::Disconnected;
            let capturing = self.capture.is_some();

            tokio::select! {
                chunk = next_chunk(&mut self.capture), if capturing => match chunk {
                    Some(chunk) => {
                        if let Err(e) = self.send_audio(&chunk).await {
                            tracing::warn!(error = %e, "failed to send audio frame");
                        }
                    }
                    None => {
                        if let Some(capture) = self.capture.take() {
                            capture.handle.release();
                        }
                        self.state = RealtimeState::Connected;
                        self.fail(Error::DeviceUnavailable("capture stream ended".to_string()));
                        self.queued.push_back(AdapterEvent::Failed);
                    }
                },
                event = self.transport.recv(), if connected => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => tracing::warn!(error = %e, "dropping malformed realtime frame"),
                    None => self.connection_lost(),
                },
                else => return std::future::pending().await,
            }
        }
    }

    fn take_transcript(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }

    fn set_credential(&mut self, credential: Option<Credential>) {
        self.credential = credential;
    }
}
