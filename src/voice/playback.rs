//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Sample rate for playback (matches realtime speech output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Shared output context for cues and spoken responses
pub trait AudioOutput: Send + Sync {
    /// Rate that queued samples are played at
    fn sample_rate(&self) -> u32;

    /// Whether the context is paused
    fn is_suspended(&self) -> bool;

    /// Resume a paused context
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot restart output
    fn resume(&self) -> Result<()>;

    /// Queue mono samples; the receiver fires once they have played
    ///
    /// # Errors
    ///
    /// Returns error if the context has been closed
    fn enqueue(&self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>>;

    /// Close the context, dropping anything still queued
    fn close(&self);
}

struct Queued {
    samples: Vec<f32>,
    position: usize,
    done: Option<oneshot::Sender<()>>,
}

enum Control {
    Resume,
    Close,
}

/// Plays audio to the default output device
///
/// The cpal stream lives on a dedicated thread; this handle only queues samples.
pub struct CpalOutput {
    queue: Arc<Mutex<VecDeque<Queued>>>,
    control: Mutex<Option<std_mpsc::Sender<Control>>>,
    suspended: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let config = output_config()?;
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let suspended = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn({
                let queue = Arc::clone(&queue);
                let suspended = Arc::clone(&suspended);
                move || run_output(&config, queue, &suspended, &control_rx, &ready_tx)
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::DeviceUnavailable("playback thread exited".to_string()))??;

        Ok(Self {
            queue,
            control: Mutex::new(Some(control_tx)),
            suspended,
        })
    }

    fn send(&self, message: Control) -> Result<()> {
        let control = self
            .control
            .lock()
            .map_err(|_| Error::DeviceUnavailable("playback control poisoned".to_string()))?;
        control
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable("playback closed".to_string()))?
            .send(message)
            .map_err(|_| Error::DeviceUnavailable("playback thread exited".to_string()))
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        PLAYBACK_SAMPLE_RATE
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn resume(&self) -> Result<()> {
        self.send(Control::Resume)
    }

    fn enqueue(&self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control.lock().map(|c| c.is_none()).unwrap_or(true) {
            return Err(Error::DeviceUnavailable("playback closed".to_string()));
        }

        self.queue
            .lock()
            .map_err(|_| Error::DeviceUnavailable("playback queue poisoned".to_string()))?
            .push_back(Queued {
                samples,
                position: 0,
                done: Some(done_tx),
            });
        Ok(done_rx)
    }

    fn close(&self) {
        let _ = self.send(Control::Close);
        if let Ok(mut control) = self.control.lock() {
            control.take();
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn output_config() -> Result<StreamConfig> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels = config.channels,
        "audio playback initialized"
    );

    Ok(config)
}

fn run_output(
    config: &StreamConfig,
    queue: Arc<Mutex<VecDeque<Queued>>>,
    suspended: &AtomicBool,
    control: &std_mpsc::Receiver<Control>,
    ready: &std_mpsc::Sender<Result<()>>,
) {
    let stream = match build_output_stream(config, queue) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Ok(message) = control.recv() {
        match message {
            Control::Resume => match stream.play() {
                Ok(()) => suspended.store(false, Ordering::Release),
                Err(e) => tracing::warn!(error = %e, "failed to resume playback"),
            },
            Control::Close => break,
        }
    }

    drop(stream);
    tracing::debug!("audio playback closed");
}

fn build_output_stream(
    config: &StreamConfig,
    queue: Arc<Mutex<VecDeque<Queued>>>,
) -> Result<Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device".to_string()))?;

    let channels = usize::from(config.channels.max(1));

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };

                for frame in data.chunks_mut(channels) {
                    let sample = next_sample(&mut queue);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

/// Pop the next sample, signalling each buffer as it drains
fn next_sample(queue: &mut VecDeque<Queued>) -> f32 {
    while let Some(front) = queue.front_mut() {
        if let Some(&sample) = front.samples.get(front.position) {
            front.position += 1;
            return sample;
        }
        if let Some(done) = queue.pop_front().and_then(|mut q| q.done.take()) {
            let _ = done.send(());
        }
    }
    0.0
}
