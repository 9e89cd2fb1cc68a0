//! Arbitration between capture strategies
//!
//! [`VoiceController`] owns exactly one active adapter, picked from the host's
//! capabilities and the caller's preference. It derives the state shown on the
//! control, plays feedback cues at transitions, and forwards finished text to
//! the consumer channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::tones::{self, CueKind, ToneEngine};
use super::{
    AdapterEvent, AdapterPhase, AudioFormat, AudioOutput, AudioSource, BufferedRecorder,
    Capabilities, CaptureConstraints, PermissionGate, PermissionState, Preference,
    PresentationState, RealtimeTransport, RealtimeVoice, RemoteTranscriber, SpeechEngine,
    Strategy, StreamingRecognizer, Transcriber, VoiceAdapter, VoiceEvent, derive_presentation,
    negotiate_format, select_strategy,
};
use crate::config::{Config, Credential};
use crate::{Error, Result};

/// Host capabilities handed to the controller
///
/// Anything left as `None` is treated as unavailable. Without a transcriber the
/// remote service from configuration is used.
#[derive(Default)]
pub struct VoiceBackends {
    pub engine: Option<Box<dyn SpeechEngine>>,
    pub audio: Option<Arc<dyn AudioSource>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub realtime: Option<Box<dyn RealtimeTransport>>,
    pub output: Option<Arc<dyn AudioOutput>>,
    /// Falls back to the engine registered with [`tones::init`]
    pub tones: Option<Arc<ToneEngine>>,
}

/// Drives the single voice control
pub struct VoiceController {
    preference: Preference,
    capabilities: Capabilities,
    strategy: Option<Strategy>,
    active: Option<Box<dyn VoiceAdapter>>,
    parked: HashMap<Strategy, Box<dyn VoiceAdapter>>,
    gate: Option<PermissionGate>,
    permission: PermissionState,
    tones: Option<Arc<ToneEngine>>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    presented: PresentationState,
    last_error: Option<Error>,
}

impl VoiceController {
    /// Build a controller and select its initial strategy
    ///
    /// Capabilities are computed once here; only a credential change updates
    /// them afterwards.
    #[must_use]
    pub fn new(
        config: &Config,
        backends: VoiceBackends,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> Self {
        let VoiceBackends {
            engine,
            audio,
            transcriber,
            realtime,
            output,
            tones,
        } = backends;

        let mut capabilities = Capabilities {
            remote_key_present: config.api_key.is_some(),
            ..Capabilities::default()
        };
        let mut parked: HashMap<Strategy, Box<dyn VoiceAdapter>> = HashMap::new();

        if let Some(engine) = engine {
            capabilities.streaming_available = engine.is_supported();
            parked.insert(
                Strategy::Streaming,
                Box::new(StreamingRecognizer::new(engine, config)),
            );
        }

        if let Some(audio) = audio.as_ref() {
            capabilities.buffered_capture_available =
                audio.is_supported() && negotiate_format(audio.as_ref()).is_ok();

            let transcriber = transcriber
                .unwrap_or_else(|| Arc::new(RemoteTranscriber::new(&config.transcription)));
            parked.insert(
                Strategy::Buffered,
                Box::new(BufferedRecorder::new(Arc::clone(audio), transcriber, config)),
            );

            if let Some(transport) = realtime {
                capabilities.realtime_available = audio.supports_format(&AudioFormat::PCM16);
                parked.insert(
                    Strategy::Realtime,
                    Box::new(RealtimeVoice::new(
                        transport,
                        Arc::clone(audio),
                        output,
                        config,
                    )),
                );
            }
        }

        let gate = audio.map(|audio| {
            PermissionGate::new(audio, CaptureConstraints::from(&config.capture))
        });
        let tones = tones
            .or_else(tones::shared)
            .filter(|_| config.tones.enabled);

        let mut controller = Self {
            preference: config.preference,
            capabilities,
            strategy: None,
            active: None,
            parked,
            gate,
            permission: PermissionState::Prompt,
            tones,
            events,
            presented: PresentationState::Unsupported,
            last_error: None,
        };
        controller.select();
        controller.presented = controller.presentation_state();

        tracing::info!(
            strategy = ?controller.strategy,
            preference = ?controller.preference,
            capabilities = ?controller.capabilities,
            "voice controller ready"
        );
        controller
    }

    /// Capabilities the strategy was selected from
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Active strategy; `None` when nothing can run
    #[must_use]
    pub const fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    #[must_use]
    pub const fn permission_state(&self) -> PermissionState {
        self.permission
    }

    /// Most recent adapter error
    #[must_use]
    pub const fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// State to show on the control
    #[must_use]
    pub fn presentation_state(&self) -> PresentationState {
        derive_presentation(
            self.strategy.is_some(),
            self.permission,
            self.active.as_ref().map(|a| a.phase()),
        )
    }

    /// Short status line for the control
    #[must_use]
    pub fn status_text(&self) -> String {
        match self.presentation_state() {
            PresentationState::Unsupported => "Voice input unavailable".to_string(),
            PresentationState::PermissionDenied => "Microphone access denied".to_string(),
            PresentationState::Processing if self.strategy == Some(Strategy::Realtime) => {
                "Thinking...".to_string()
            }
            PresentationState::Processing => "Transcribing...".to_string(),
            PresentationState::Active => "Listening...".to_string(),
            PresentationState::Idle => self
                .last_error
                .as_ref()
                .map_or_else(|| "Tap to speak".to_string(), Error::status_message),
        }
    }

    /// Handle a click on the control
    ///
    /// Asks for microphone access on first use. Stops a live session, otherwise
    /// starts one. Failures are reported on the event channel.
    pub async fn activate(&mut self) -> PresentationState {
        if self.strategy.is_none() {
            tracing::debug!("voice input unsupported, ignoring activation");
            return self.publish_state();
        }

        match self.permission {
            PermissionState::Denied => {
                tracing::debug!("microphone access denied, ignoring activation");
                return self.publish_state();
            }
            PermissionState::Prompt | PermissionState::Checking => {
                if let Some(gate) = self.gate.as_mut() {
                    let granted = gate.request_access().await;
                    self.permission = gate.state();
                    if !granted {
                        self.report(&Error::PermissionDenied);
                        return self.publish_state();
                    }
                }
            }
            PermissionState::Granted => {}
        }

        let Some(adapter) = self.active.as_mut() else {
            return self.publish_state();
        };

        let strategy = adapter.strategy();
        let starting = !adapter.is_live();
        let result = if !starting {
            tracing::debug!(?strategy, "stopping voice session");
            adapter.stop().await
        } else if adapter.phase() == AdapterPhase::Processing {
            tracing::debug!(?strategy, "voice session busy, ignoring activation");
            return self.publish_state();
        } else {
            tracing::debug!(?strategy, "starting voice session");
            adapter.start().await
        };

        match result {
            Ok(()) if starting => {
                self.last_error = None;
                self.permission = PermissionState::Granted;
                self.cue(CueKind::ListeningStarted);
            }
            Ok(()) => {}
            Err(e) => self.report(&e),
        }
        self.publish_state()
    }

    /// Tear down the live session without delivering anything
    pub async fn cancel(&mut self) {
        if let Some(adapter) = self.active.as_mut() {
            adapter.cancel().await;
            tracing::debug!(strategy = ?adapter.strategy(), "voice session cancelled");
        }
        self.publish_state();
    }

    /// Wait for the next adapter event and apply it
    ///
    /// Cancel-safe; pending forever while no strategy is available.
    pub async fn process_next(&mut self) {
        let Some(adapter) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        let event = adapter.next_event().await;
        self.handle_event(event);
    }

    fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Interim(text) => self.emit(VoiceEvent::Interim { text }),
            AdapterEvent::Final(fragment) => {
                let text = self
                    .active
                    .as_mut()
                    .map(|a| a.take_transcript())
                    .unwrap_or_default();
                if text.trim().is_empty() {
                    tracing::trace!(fragment = %fragment.text, "final fragment already forwarded");
                } else {
                    tracing::info!(
                        transcript = %text,
                        confidence = fragment.confidence,
                        "forwarding transcript"
                    );
                    self.emit(VoiceEvent::Transcript { text });
                    self.cue(CueKind::Success);
                }
            }
            AdapterEvent::Response(text) => self.emit(VoiceEvent::Response { text }),
            AdapterEvent::Actions(actions) => self.emit(VoiceEvent::Actions { actions }),
            AdapterEvent::Processing => self.cue(CueKind::Thinking),
            AdapterEvent::Stopped => self.cue(CueKind::ListeningEnded),
            AdapterEvent::Completed => {}
            AdapterEvent::Failed => {
                let error = self.active.as_ref().and_then(|a| a.last_error().cloned());
                if let Some(error) = error {
                    self.report(&error);
                }
            }
        }
        self.publish_state();
    }

    /// Change the strategy preference, tearing down the live session if the
    /// selection changes
    pub async fn set_preference(&mut self, preference: Preference) {
        if preference == self.preference {
            return;
        }
        self.preference = preference;
        self.reselect().await;
    }

    /// Replace the remote-service credential
    pub async fn set_credential(&mut self, credential: Option<Credential>) {
        self.capabilities.remote_key_present = credential.is_some();
        if let Some(adapter) = self.active.as_mut() {
            adapter.set_credential(credential.clone());
        }
        for adapter in self.parked.values_mut() {
            adapter.set_credential(credential.clone());
        }
        self.reselect().await;
    }

    /// Re-query microphone permission
    pub async fn refresh_permission(&mut self) -> PermissionState {
        self.permission = match self.gate.as_mut() {
            Some(gate) => gate.query_permission().await,
            // The recognizer prompts for itself on the next start
            None => PermissionState::Prompt,
        };
        self.publish_state();
        self.permission
    }

    /// Tear down the live session and close the tone context
    pub async fn shutdown(&mut self) {
        if let Some(adapter) = self.active.as_mut() {
            adapter.cancel().await;
        }
        if let Some(tones) = self.tones.as_ref() {
            tones.shutdown();
        }
        tracing::debug!("voice controller shut down");
    }

    async fn reselect(&mut self) {
        let next = select_strategy(self.preference, &self.capabilities).ok();
        if next == self.strategy {
            self.publish_state();
            return;
        }

        if let Some(mut adapter) = self.active.take() {
            adapter.cancel().await;
            self.parked.insert(adapter.strategy(), adapter);
        }
        self.select();
        tracing::info!(strategy = ?self.strategy, preference = ?self.preference, "voice strategy changed");
        self.publish_state();
    }

    /// Move the selected adapter from the parked set into the active slot
    fn select(&mut self) {
        self.strategy = match select_strategy(self.preference, &self.capabilities) {
            Ok(strategy) if self.parked.contains_key(&strategy) => Some(strategy),
            Ok(strategy) => {
                tracing::warn!(?strategy, "selected strategy has no adapter");
                None
            }
            Err(e) => {
                tracing::info!(error = %e, "no voice strategy available");
                None
            }
        };
        self.active = self.strategy.and_then(|s| self.parked.remove(&s));
    }

    fn report(&mut self, error: &Error) {
        tracing::warn!(strategy = ?self.strategy, error = %error, "voice error");
        if matches!(error, Error::PermissionDenied) {
            self.permission = PermissionState::Denied;
            if let Some(gate) = self.gate.as_mut() {
                gate.mark_denied();
            }
        }
        self.last_error = Some(error.clone());
        self.emit(VoiceEvent::Error {
            message: error.status_message(),
            recoverable: error.is_recoverable(),
        });
        self.cue(CueKind::Error);
    }

    fn publish_state(&mut self) -> PresentationState {
        let state = self.presentation_state();
        if state != self.presented {
            self.presented = state;
            tracing::debug!(?state, "presentation state changed");
            self.emit(VoiceEvent::State { state });
        }
        state
    }

    fn emit(&self, event: VoiceEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("voice event consumer gone");
        }
    }

    fn cue(&self, kind: CueKind) {
        if let Some(tones) = self.tones.as_ref() {
            let tones = Arc::clone(tones);
            tokio::spawn(async move { tones.play(kind).await });
        }
    }

    /// Run the controller as a task driven by a [`VoiceHandle`]
    pub fn spawn(self) -> (VoiceHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(commands_rx));
        (
            VoiceHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<VoiceCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(VoiceCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                () = self.process_next() => {}
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: VoiceCommand) {
        match command {
            VoiceCommand::Activate { reply } => {
                let state = self.activate().await;
                let _ = reply.send(state);
            }
            VoiceCommand::Cancel => self.cancel().await,
            VoiceCommand::SetPreference(preference) => self.set_preference(preference).await,
            VoiceCommand::SetCredential(credential) => self.set_credential(credential).await,
            VoiceCommand::RefreshPermission => {
                self.refresh_permission().await;
            }
            VoiceCommand::Shutdown => {}
        }
    }
}

/// Command sent to a spawned controller
#[derive(Debug)]
pub enum VoiceCommand {
    Activate {
        reply: oneshot::Sender<PresentationState>,
    },
    Cancel,
    SetPreference(Preference),
    SetCredential(Option<Credential>),
    RefreshPermission,
    Shutdown,
}

/// Cloneable handle to a spawned controller
#[derive(Debug, Clone)]
pub struct VoiceHandle {
    commands: mpsc::UnboundedSender<VoiceCommand>,
}

impl VoiceHandle {
    /// Click the control; resolves to the resulting presentation state
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the controller has stopped
    pub async fn activate(&self) -> Result<PresentationState> {
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::Activate { reply })?;
        rx.await.map_err(|_| Error::Aborted)
    }

    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the controller has stopped
    pub fn cancel(&self) -> Result<()> {
        self.send(VoiceCommand::Cancel)
    }

    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the controller has stopped
    pub fn set_preference(&self, preference: Preference) -> Result<()> {
        self.send(VoiceCommand::SetPreference(preference))
    }

    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the controller has stopped
    pub fn set_credential(&self, credential: Option<Credential>) -> Result<()> {
        self.send(VoiceCommand::SetCredential(credential))
    }

    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the controller has stopped
    pub fn refresh_permission(&self) -> Result<()> {
        self.send(VoiceCommand::RefreshPermission)
    }

    /// Stop the controller task
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] if the controller has already stopped
    pub fn shutdown(&self) -> Result<()> {
        self.send(VoiceCommand::Shutdown)
    }

    fn send(&self, command: VoiceCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Aborted)
    }
}
