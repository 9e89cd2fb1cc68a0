//! Feedback tones
//!
//! Short synthetic cues played at capture transitions. Playback is best-effort:
//! failures are logged and never reach the capture path.
//!
//! Hosts either hold a [`ToneEngine`] directly or register one process-wide with
//! [`init`] and call [`play`] anywhere.

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex, OnceLock};

use super::AudioOutput;
use crate::{Error, Result};

/// Linear fade-in applied to every tone
const RAMP_IN_MS: u32 = 10;

/// Ramp-down at the end of non-fading tones
const RAMP_OUT_MS: u32 = 10;

/// Silence between sequenced tones
const GAP_MS: u32 = 50;

/// Which cue to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CueKind {
    ListeningStarted,
    ListeningEnded,
    Success,
    Error,
    Thinking,
}

/// Oscillator shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Triangle,
    Sawtooth,
}

impl Waveform {
    /// Sample the waveform at `phase` cycles
    fn sample(self, phase: f32) -> f32 {
        let t = phase.fract();
        match self {
            Self::Sine => (TAU * t).sin(),
            Self::Square => {
                if t < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::Triangle => 1.0 - 4.0 * (t - 0.5).abs(),
            Self::Sawtooth => 2.0 * t - 1.0,
        }
    }
}

/// A single oscillator note
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency: f32,
    pub duration_ms: u32,
}

/// Pure description of a cue
#[derive(Debug, Clone, PartialEq)]
pub struct SoundCue {
    /// Played in order with a short gap between them
    pub tones: Vec<Tone>,
    pub waveform: Waveform,
    /// Peak gain in `[0, 1]`
    pub volume: f32,
    /// Ramp down across the whole tone instead of holding
    pub fade_out: bool,
}

const fn tone(frequency: f32, duration_ms: u32) -> Tone {
    Tone {
        frequency,
        duration_ms,
    }
}

impl CueKind {
    /// Descriptor for this cue
    #[must_use]
    pub fn descriptor(self) -> SoundCue {
        match self {
            Self::ListeningStarted => SoundCue {
                tones: vec![tone(659.25, 90), tone(880.0, 110)],
                waveform: Waveform::Sine,
                volume: 0.25,
                fade_out: false,
            },
            Self::ListeningEnded => SoundCue {
                tones: vec![tone(880.0, 90), tone(659.25, 110)],
                waveform: Waveform::Sine,
                volume: 0.25,
                fade_out: true,
            },
            Self::Success => SoundCue {
                tones: vec![tone(523.25, 90), tone(659.25, 90), tone(783.99, 160)],
                waveform: Waveform::Sine,
                volume: 0.25,
                fade_out: true,
            },
            Self::Error => SoundCue {
                tones: vec![tone(330.0, 140), tone(220.0, 220)],
                waveform: Waveform::Triangle,
                volume: 0.3,
                fade_out: true,
            },
            Self::Thinking => SoundCue {
                tones: vec![tone(440.0, 70)],
                waveform: Waveform::Triangle,
                volume: 0.15,
                fade_out: false,
            },
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn ms_to_samples(ms: u32, sample_rate: u32) -> usize {
    (u64::from(ms) * u64::from(sample_rate) / 1000) as usize
}

/// Render a cue to mono samples
///
/// Each tone ramps in over 10 ms, then either fades to silence across its full
/// duration or holds and ramps down over its final 10 ms.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn render_cue(cue: &SoundCue, sample_rate: u32, master_volume: f32) -> Vec<f32> {
    let peak = (cue.volume * master_volume).clamp(0.0, 1.0);
    let ramp_in = ms_to_samples(RAMP_IN_MS, sample_rate).max(1);
    let ramp_out = ms_to_samples(RAMP_OUT_MS, sample_rate).max(1);
    let gap = ms_to_samples(GAP_MS, sample_rate);

    let mut samples = Vec::new();
    for (index, tone) in cue.tones.iter().enumerate() {
        if index > 0 {
            samples.extend(std::iter::repeat_n(0.0, gap));
        }

        let len = ms_to_samples(tone.duration_ms, sample_rate);
        let step = tone.frequency / sample_rate as f32;

        samples.extend((0..len).map(|i| {
            let envelope = if i < ramp_in {
                i as f32 / ramp_in as f32
            } else if cue.fade_out {
                let remaining = (len - i) as f32;
                let span = (len - ramp_in).max(1) as f32;
                remaining / span
            } else if i + ramp_out >= len {
                (len - i) as f32 / ramp_out as f32
            } else {
                1.0
            };
            peak * envelope.min(1.0) * cue.waveform.sample(step * i as f32)
        }));
    }

    samples
}

/// Creates the shared output context on first use
pub type OutputFactory = Box<dyn Fn() -> Result<Arc<dyn AudioOutput>> + Send + Sync>;

/// Plays feedback cues through one lazily created output context
pub struct ToneEngine {
    factory: OutputFactory,
    context: Mutex<Option<Arc<dyn AudioOutput>>>,
    volume: f32,
}

impl ToneEngine {
    /// Create an engine; the output context is built on the first cue
    #[must_use]
    pub fn new(factory: OutputFactory) -> Self {
        Self {
            factory,
            context: Mutex::new(None),
            volume: 1.0,
        }
    }

    /// Set the master volume multiplier
    #[must_use]
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume.clamp(0.0, 1.0);
        self
    }

    /// Play a cue, waiting for it to finish; failures are logged and swallowed
    pub async fn play(&self, kind: CueKind) {
        if let Err(e) = self.try_play(kind).await {
            tracing::warn!(cue = ?kind, error = %e, "failed to play feedback tone");
        }
    }

    async fn try_play(&self, kind: CueKind) -> Result<()> {
        let context = self.context()?;
        if context.is_suspended() {
            context.resume()?;
        }

        let samples = render_cue(&kind.descriptor(), context.sample_rate(), self.volume);
        let done = context.enqueue(samples)?;
        // Closing the context mid-cue drops the sender; that still counts as done
        let _ = done.await;

        tracing::trace!(cue = ?kind, "feedback tone played");
        Ok(())
    }

    fn context(&self) -> Result<Arc<dyn AudioOutput>> {
        let mut slot = self
            .context
            .lock()
            .map_err(|_| Error::DeviceUnavailable("tone context poisoned".to_string()))?;

        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }

        let context = (self.factory)()?;
        tracing::debug!(sample_rate = context.sample_rate(), "tone context created");
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Whether the output context has been created
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.context.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Close the output context; the next cue creates a fresh one
    pub fn shutdown(&self) {
        let context = self.context.lock().ok().and_then(|mut c| c.take());
        if let Some(context) = context {
            context.close();
            tracing::debug!("tone context closed");
        }
    }
}

/// Process-wide engine
static ENGINE: OnceLock<Arc<ToneEngine>> = OnceLock::new();

/// Register the process-wide engine
///
/// Returns false if one was already registered.
pub fn init(engine: ToneEngine) -> bool {
    ENGINE.set(Arc::new(engine)).is_ok()
}

/// The process-wide engine, if registered
pub fn shared() -> Option<Arc<ToneEngine>> {
    ENGINE.get().cloned()
}

/// Play a cue on the process-wide engine; a no-op if none is registered
pub async fn play(kind: CueKind) {
    if let Some(engine) = ENGINE.get() {
        engine.play(kind).await;
    }
}

/// Close the process-wide engine's output context
pub fn shutdown() {
    if let Some(engine) = ENGINE.get() {
        engine.shutdown();
    }
}
