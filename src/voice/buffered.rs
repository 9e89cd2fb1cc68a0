//! Record-then-upload capture
//!
//! Audio is captured in short slices while recording and concatenated on stop.
//! The finished buffer is uploaded to the remote transcription service when a
//! credential is configured, otherwise it is kept for an explicit
//! [`BufferedRecorder::transcribe_audio`] call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    AdapterEvent, AdapterPhase, AudioBuffer, AudioFormat, AudioSource, CaptureConstraints,
    CaptureHandle, Strategy, Transcriber, TranscriptEvent, VoiceAdapter, negotiate_format,
};
use crate::config::{Config, Credential};
use crate::{Error, Result};

/// Recorder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Transcribing,
    Error,
}

struct Capture {
    handle: CaptureHandle,
    format: AudioFormat,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    chunks: Vec<Vec<u8>>,
}

/// Buffered capture strategy
pub struct BufferedRecorder {
    source: Arc<dyn AudioSource>,
    transcriber: Arc<dyn Transcriber>,
    credential: Option<Credential>,
    constraints: CaptureConstraints,
    slice: Duration,
    state: RecordingState,
    capture: Option<Capture>,
    pending: Option<AudioBuffer>,
    job: Option<JoinHandle<Result<String>>>,
    transcript: String,
    queued: VecDeque<AdapterEvent>,
    error: Option<Error>,
    session: Option<Uuid>,
    in_flight: bool,
}

impl BufferedRecorder {
    #[must_use]
    pub fn new(
        source: Arc<dyn AudioSource>,
        transcriber: Arc<dyn Transcriber>,
        config: &Config,
    ) -> Self {
        Self {
            source,
            transcriber,
            credential: config.api_key.clone(),
            constraints: CaptureConstraints::from(&config.capture),
            slice: config.capture.slice_interval,
            state: RecordingState::Idle,
            capture: None,
            pending: None,
            job: None,
            transcript: String::new(),
            queued: VecDeque::new(),
            error: None,
            session: None,
            in_flight: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RecordingState {
        self.state
    }

    /// Whether a credential is configured
    #[must_use]
    pub const fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Start recording into a fresh buffer
    ///
    /// # Errors
    ///
    /// Returns error if no recording format is supported or the microphone
    /// cannot be acquired
    pub async fn start_recording(&mut self) -> Result<()> {
        self.recover_interrupted();
        if self.state == RecordingState::Recording {
            tracing::debug!("already recording");
            return Ok(());
        }
        if self.job.is_some() || self.capture.is_some() {
            self.teardown();
        }

        self.error = None;
        self.transcript.clear();
        self.queued.clear();
        self.session = Some(Uuid::new_v4());

        self.in_flight = true;
        let result = open_capture(self.source.as_ref(), &self.constraints, self.slice).await;
        self.in_flight = false;

        match result {
            Ok(capture) => {
                tracing::info!(session = ?self.session, format = capture.format.mime, "recording");
                self.capture = Some(capture);
                self.state = RecordingState::Recording;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop recording and transcribe
    ///
    /// The device is released before transcription starts, whatever the
    /// outcome. Without a credential this returns an empty string and keeps the
    /// recording for [`take_pending_buffer`](Self::take_pending_buffer).
    ///
    /// # Errors
    ///
    /// Returns error if the final chunk cannot be flushed or transcription fails
    pub async fn stop_recording(&mut self) -> Result<String> {
        self.recover_interrupted();
        let buffer = match self.finish_capture() {
            Ok(Some(buffer)) => buffer,
            Ok(None) => return Ok(String::new()),
            Err(e) => return Err(self.fail(e)),
        };

        if !self.has_credential() {
            self.keep_for_later(buffer);
            return Ok(String::new());
        }

        self.transcribe_audio(buffer).await
    }

    /// Transcribe a finished recording
    ///
    /// Empty recordings resolve to an empty string without calling the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredential`] without a credential, or the
    /// service error
    pub async fn transcribe_audio(&mut self, buffer: AudioBuffer) -> Result<String> {
        self.recover_interrupted();
        let Some(credential) = self.credential.clone() else {
            return Err(self.fail(Error::MissingCredential));
        };

        if buffer.is_empty() {
            tracing::debug!(session = ?self.session, "empty recording, skipping transcription");
            self.state = RecordingState::Idle;
            return Ok(String::new());
        }

        self.state = RecordingState::Transcribing;
        self.in_flight = true;
        let result = self.transcriber.transcribe(buffer, &credential).await;
        self.in_flight = false;

        match result {
            Ok(text) => {
                self.state = RecordingState::Idle;
                Ok(text)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop capture and discard the recording
    pub fn cancel_recording(&mut self) {
        self.teardown();
        tracing::debug!(session = ?self.session, "recording cancelled");
    }

    /// Hand out the recording kept by a stop without a credential
    pub fn take_pending_buffer(&mut self) -> Option<AudioBuffer> {
        self.pending.take()
    }

    /// Flush, release, and concatenate the live capture
    fn finish_capture(&mut self) -> Result<Option<AudioBuffer>> {
        let Some(Capture {
            mut handle,
            format,
            mut receiver,
            mut chunks,
        }) = self.capture.take()
        else {
            return Ok(None);
        };

        let finished = handle.finish();
        handle.release();

        while let Ok(chunk) = receiver.try_recv() {
            chunks.push(chunk);
        }
        finished?;

        let buffer = AudioBuffer::from_chunks(format, chunks);
        tracing::debug!(session = ?self.session, audio_bytes = buffer.len(), "recording finished");
        Ok(Some(buffer))
    }

    fn keep_for_later(&mut self, buffer: AudioBuffer) {
        tracing::info!(
            session = ?self.session,
            audio_bytes = buffer.len(),
            "no API key, keeping recording"
        );
        self.pending = Some(buffer);
        self.state = RecordingState::Idle;
    }

    fn teardown(&mut self) {
        self.in_flight = false;
        if let Some(job) = self.job.take() {
            job.abort();
        }
        if let Some(capture) = self.capture.take() {
            capture.handle.release();
        }
        self.queued.clear();
        self.transcript.clear();
        self.state = RecordingState::Idle;
    }

    /// A previous future was dropped mid-operation
    fn recover_interrupted(&mut self) {
        if self.in_flight {
            tracing::warn!("previous recording operation interrupted, resetting");
            self.teardown();
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        tracing::error!(session = ?self.session, error = %error, "buffered capture failed");
        self.state = RecordingState::Error;
        self.error = Some(error.clone());
        error
    }

    fn complete_job(&mut self, outcome: std::result::Result<Result<String>, tokio::task::JoinError>) {
        let result = outcome.unwrap_or_else(|e| {
            if e.is_cancelled() {
                Err(Error::Aborted)
            } else {
                Err(Error::Unknown(e.to_string()))
            }
        });

        match result {
            Ok(text) if text.trim().is_empty() => {
                self.state = RecordingState::Idle;
                self.queued.push_back(AdapterEvent::Completed);
            }
            Ok(text) => {
                self.state = RecordingState::Idle;
                self.transcript.clone_from(&text);
                self.queued
                    .push_back(AdapterEvent::Final(TranscriptEvent::new(text, true, 1.0)));
            }
            Err(e) => {
                self.fail(e);
                self.queued.push_back(AdapterEvent::Failed);
            }
        }
    }
}

async fn open_capture(
    source: &dyn AudioSource,
    constraints: &CaptureConstraints,
    slice: Duration,
) -> Result<Capture> {
    if !source.is_supported() {
        return Err(Error::Unsupported);
    }
    let format = negotiate_format(source)?;

    let stream = source.acquire(constraints).await?;
    let mut handle = CaptureHandle::new(stream);
    let (sender, receiver) = mpsc::unbounded_channel();
    handle.start(format, slice, sender)?;

    Ok(Capture {
        handle,
        format,
        receiver,
        chunks: Vec::new(),
    })
}

#[async_trait]
impl VoiceAdapter for BufferedRecorder {
    fn strategy(&self) -> Strategy {
        Strategy::Buffered
    }

    fn phase(&self) -> AdapterPhase {
        match self.state {
            RecordingState::Idle => AdapterPhase::Idle,
            RecordingState::Recording => AdapterPhase::Active,
            RecordingState::Transcribing => AdapterPhase::Processing,
            RecordingState::Error => AdapterPhase::Error,
        }
    }

    fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    async fn start(&mut self) -> Result<()> {
        self.start_recording().await
    }

    /// Release the device, then transcribe in the background
    ///
    /// The result arrives from [`next_event`](VoiceAdapter::next_event).
    async fn stop(&mut self) -> Result<()> {
        self.recover_interrupted();
        let buffer = match self.finish_capture() {
            Ok(Some(buffer)) => buffer,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.fail(e)),
        };
        self.queued.push_back(AdapterEvent::Stopped);

        let Some(credential) = self.credential.clone() else {
            self.keep_for_later(buffer);
            return Ok(());
        };

        if buffer.is_empty() {
            self.state = RecordingState::Idle;
            self.queued.push_back(AdapterEvent::Completed);
            return Ok(());
        }

        let transcriber = Arc::clone(&self.transcriber);
        self.job = Some(tokio::spawn(async move {
            transcriber.transcribe(buffer, &credential).await
        }));
        self.state = RecordingState::Transcribing;
        self.queued.push_back(AdapterEvent::Processing);
        Ok(())
    }

    async fn cancel(&mut self) {
        self.cancel_recording();
    }

    async fn next_event(&mut self) -> AdapterEvent {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return event;
            }

            if let Some(job) = self.job.as_mut() {
                let outcome = job.await;
                self.job = None;
                self.complete_job(outcome);
                continue;
            }

            let Some(capture) = self.capture.as_mut() else {
                return std::future::pending().await;
            };

            if let Some(chunk) = capture.receiver.recv().await {
                capture.chunks.push(chunk);
            } else {
                // Capture thread went away without being asked to
                if let Some(capture) = self.capture.take() {
                    capture.handle.release();
                }
                self.fail(Error::DeviceUnavailable("capture stream ended".to_string()));
                self.queued.push_back(AdapterEvent::Failed);
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
