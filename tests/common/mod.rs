//! Shared test utilities
//!
//! In-memory stand-ins for the host microphone, recognizer, transcription
//! service, and speaker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use quote_voice::config::Credential;
use quote_voice::voice::{
    AudioBuffer, AudioFormat, AudioOutput, AudioSource, CaptureConstraints, DeviceStream,
    EngineEvent, EngineStartError, PermissionState, RecognitionOptions, SpeechEngine,
    Transcriber,
};
use quote_voice::{Error, Result};

/// Counters shared between a fake source and its streams
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl DeviceCounters {
    /// Streams acquired and not yet released
    pub fn live(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Microphone that replays scripted chunks as soon as capture starts
pub struct FakeAudioSource {
    pub formats: Vec<AudioFormat>,
    pub chunks: Vec<Vec<u8>>,
    pub deny: bool,
    pub permission: Option<PermissionState>,
    pub counters: Arc<DeviceCounters>,
}

impl FakeAudioSource {
    /// A source recording webm/opus that yields `chunks`
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            formats: vec![AudioFormat::WEBM_OPUS, AudioFormat::PCM16],
            chunks,
            deny: false,
            permission: None,
            counters: Arc::new(DeviceCounters::default()),
        }
    }

    /// A source whose user refuses microphone access
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn counters(&self) -> Arc<DeviceCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl AudioSource for FakeAudioSource {
    fn is_supported(&self) -> bool {
        true
    }

    fn supports_format(&self, format: &AudioFormat) -> bool {
        self.formats.contains(format)
    }

    async fn query_permission(&self) -> Option<PermissionState> {
        self.permission
    }

    async fn acquire(&self, _constraints: &CaptureConstraints) -> Result<Box<dyn DeviceStream>> {
        if self.deny {
            return Err(Error::PermissionDenied);
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            chunks: self.chunks.clone(),
            sender: None,
            released: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FakeStream {
    chunks: Vec<Vec<u8>>,
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    released: bool,
    counters: Arc<DeviceCounters>,
}

impl DeviceStream for FakeStream {
    fn start(
        &mut self,
        _format: AudioFormat,
        _slice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<()> {
        for chunk in self.chunks.drain(..) {
            let _ = chunks.send(chunk);
        }
        self.sender = Some(chunks);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.sender = None;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Test-side controls for a [`FakeEngine`]
#[derive(Clone, Default)]
pub struct EngineRemote {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>>,
    pub starts: Arc<AtomicUsize>,
    pub aborted: Arc<AtomicBool>,
}

impl EngineRemote {
    /// Deliver an engine callback to the running session
    pub fn emit(&self, event: EngineEvent) {
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .expect("engine not started")
            .send(event)
            .expect("recognizer dropped");
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

/// Recognizer that acknowledges starts and ends on stop
pub struct FakeEngine {
    pub supported: bool,
    remote: EngineRemote,
}

impl FakeEngine {
    pub fn new() -> (Self, EngineRemote) {
        let remote = EngineRemote::default();
        (
            Self {
                supported: true,
                remote: remote.clone(),
            },
            remote,
        )
    }
}

impl SpeechEngine for FakeEngine {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn start(
        &mut self,
        _options: &RecognitionOptions,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> std::result::Result<(), EngineStartError> {
        self.remote.starts.fetch_add(1, Ordering::SeqCst);
        let _ = events.send(EngineEvent::Started);
        *self.remote.sender.lock().unwrap() = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sender) = self.remote.sender.lock().unwrap().as_ref() {
            let _ = sender.send(EngineEvent::Ended);
        }
    }

    fn abort(&mut self) {
        self.remote.aborted.store(true, Ordering::SeqCst);
        self.remote.sender.lock().unwrap().take();
    }
}

/// Transcription service returning a canned result
pub struct FakeTranscriber {
    response: Result<String>,
    pub calls: AtomicUsize,
    pub received_bytes: AtomicUsize,
}

impl FakeTranscriber {
    pub fn returning(text: &str) -> Self {
        Self::with_response(Ok(text.to_string()))
    }

    pub fn failing(error: Error) -> Self {
        Self::with_response(Err(error))
    }

    fn with_response(response: Result<String>) -> Self {
        Self {
            response,
            calls: AtomicUsize::new(0),
            received_bytes: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: AudioBuffer, _credential: &Credential) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received_bytes.fetch_add(audio.len(), Ordering::SeqCst);
        self.response.clone()
    }
}

/// Speaker that finishes every buffer immediately
#[derive(Default)]
pub struct FakeOutput {
    pub played: Mutex<Vec<usize>>,
    pub closed: AtomicBool,
}

impl AudioOutput for FakeOutput {
    fn sample_rate(&self) -> u32 {
        8000
    }

    fn is_suspended(&self) -> bool {
        false
    }

    fn resume(&self) -> Result<()> {
        Ok(())
    }

    fn enqueue(&self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>> {
        self.played.lock().unwrap().push(samples.len());
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Ok(rx)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One 100 ms chunk of opaque encoded audio
pub fn chunk(marker: u8) -> Vec<u8> {
    vec![marker; 160]
}

pub fn credential() -> Credential {
    Credential::new("sk-test").expect("non-empty key")
}
