//! Audio capture from microphone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::PermissionState;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Container/codec of captured audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// MIME type, including codec parameters
    pub mime: &'static str,
    /// File name used for uploads
    pub file_name: &'static str,
}

impl AudioFormat {
    pub const WEBM_OPUS: Self = Self {
        mime: "audio/webm;codecs=opus",
        file_name: "audio.webm",
    };
    pub const WEBM: Self = Self {
        mime: "audio/webm",
        file_name: "audio.webm",
    };
    pub const OGG_OPUS: Self = Self {
        mime: "audio/ogg;codecs=opus",
        file_name: "audio.ogg",
    };
    pub const MP4: Self = Self {
        mime: "audio/mp4",
        file_name: "audio.mp4",
    };
    pub const WAV: Self = Self {
        mime: "audio/wav",
        file_name: "audio.wav",
    };
    /// Raw 16-bit little-endian mono PCM, used by realtime sessions
    pub const PCM16: Self = Self {
        mime: "audio/pcm",
        file_name: "audio.pcm",
    };

    /// MIME type without codec parameters
    #[must_use]
    pub fn base_mime(&self) -> &'static str {
        self.mime.split(';').next().unwrap_or(self.mime)
    }
}

/// Recording formats, most preferred first
pub const FORMAT_PREFERENCE: [AudioFormat; 5] = [
    AudioFormat::WEBM_OPUS,
    AudioFormat::WEBM,
    AudioFormat::OGG_OPUS,
    AudioFormat::MP4,
    AudioFormat::WAV,
];

/// Pick the most preferred recording format the source supports
///
/// # Errors
///
/// Returns [`Error::DeviceUnavailable`] if none of the formats are supported
pub fn negotiate_format(source: &dyn AudioSource) -> Result<AudioFormat> {
    FORMAT_PREFERENCE
        .iter()
        .copied()
        .find(|f| source.supports_format(f))
        .ok_or_else(|| Error::DeviceUnavailable("no supported recording format".to_string()))
}

/// Requested processing for a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: SAMPLE_RATE,
        }
    }
}

impl From<&crate::config::CaptureConfig> for CaptureConstraints {
    fn from(config: &crate::config::CaptureConfig) -> Self {
        Self {
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            sample_rate: config.sample_rate,
        }
    }
}

/// Host microphone access
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Whether the host can capture at all
    fn is_supported(&self) -> bool;

    /// Whether the host can record in `format`
    fn supports_format(&self, format: &AudioFormat) -> bool;

    /// Query permission without prompting; `None` if the host cannot
    async fn query_permission(&self) -> Option<PermissionState> {
        None
    }

    /// Acquire a device stream, prompting for permission if needed
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn DeviceStream>>;
}

/// An acquired capture device
pub trait DeviceStream: Send {
    /// Begin delivering encoded chunks of roughly `slice` length
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot start
    fn start(
        &mut self,
        format: AudioFormat,
        slice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<()>;

    /// Stop capturing, delivering any buffered audio as a final chunk
    ///
    /// # Errors
    ///
    /// Returns error if the final chunk cannot be flushed
    fn finish(&mut self) -> Result<()>;

    /// Release the device; must be idempotent
    ///
    /// # Errors
    ///
    /// Returns error if the host reports a failure while releasing
    fn release(&mut self) -> Result<()>;
}

/// Owns a device stream and guarantees it is released
///
/// Released explicitly by [`release`](Self::release) or, failing that, on drop.
pub struct CaptureHandle {
    stream: Box<dyn DeviceStream>,
    released: bool,
}

impl CaptureHandle {
    #[must_use]
    pub fn new(stream: Box<dyn DeviceStream>) -> Self {
        Self {
            stream,
            released: false,
        }
    }

    /// Begin chunked capture
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot start
    pub fn start(
        &mut self,
        format: AudioFormat,
        slice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<()> {
        self.stream.start(format, slice, chunks)
    }

    /// Flush the final chunk
    ///
    /// # Errors
    ///
    /// Returns error if the flush fails
    pub fn finish(&mut self) -> Result<()> {
        self.stream.finish()
    }

    /// Release the device, logging failures
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.stream.release() {
            Ok(()) => tracing::debug!("capture device released"),
            Err(e) => tracing::warn!(error = %e, "failed to release capture device"),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Immutable recording: concatenated chunks plus their format
#[derive(Debug, PartialEq, Eq)]
pub struct AudioBuffer {
    format: AudioFormat,
    bytes: Vec<u8>,
    header_len: usize,
}

impl AudioBuffer {
    /// Concatenate chunks in arrival order
    ///
    /// WAV recordings carry their header in the first chunk; its RIFF and data
    /// lengths are patched to the final size.
    #[must_use]
    pub fn from_chunks(format: AudioFormat, chunks: Vec<Vec<u8>>) -> Self {
        let mut bytes = chunks.concat();
        let header_len = if format == AudioFormat::WAV {
            patch_wav_lengths(&mut bytes)
        } else {
            0
        };
        Self {
            format,
            bytes,
            header_len,
        }
    }

    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total size including any container header
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether no audio payload was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= self.header_len
    }
}

/// Fix up RIFF and data chunk sizes; returns the header length
fn patch_wav_lengths(bytes: &mut [u8]) -> usize {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return 0;
    }

    let riff_len = u32::try_from(bytes.len() - 8).unwrap_or(u32::MAX);
    bytes[4..8].copy_from_slice(&riff_len.to_le_bytes());

    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        if &id == b"data" {
            let data_len = u32::try_from(bytes.len() - offset - 8).unwrap_or(u32::MAX);
            bytes[offset + 4..offset + 8].copy_from_slice(&data_len.to_le_bytes());
            return offset + 8;
        }
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        offset += 8 + size + (size & 1);
    }

    0
}

/// Captures audio from the default input device
pub struct CpalSource {
    sample_rate: u32,
}

impl CpalSource {
    /// Create a source capturing at `sample_rate`
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    fn input_config(&self) -> Result<StreamConfig> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

        let rate = SampleRate(self.sample_rate);
        let supports = |channels: u16| {
            device.supported_input_configs().ok()?.find(|c| {
                c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        };

        let supported_config = supports(1)
            .or_else(|| supports(2))
            .ok_or_else(|| Error::DeviceUnavailable("no suitable audio config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = self.sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(config)
    }
}

impl Default for CpalSource {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    fn is_supported(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn supports_format(&self, format: &AudioFormat) -> bool {
        *format == AudioFormat::WAV || *format == AudioFormat::PCM16
    }

    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn DeviceStream>> {
        // Device enumeration blocks on the host audio server
        let probe = Self::new(constraints.sample_rate);
        let config = tokio::task::spawn_blocking(move || probe.input_config())
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("device probe failed: {e}")))??;

        if constraints.echo_cancellation || constraints.noise_suppression {
            tracing::debug!("host capture has no echo cancellation or noise suppression");
        }

        Ok(Box::new(CpalStream {
            config,
            worker: None,
        }))
    }
}

/// Device stream backed by a capture thread
///
/// The cpal stream lives on its own thread so the handle stays `Send`.
struct CpalStream {
    config: StreamConfig,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CpalStream {
    fn join_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::Release);
        worker
            .thread
            .join()
            .map_err(|_| Error::DeviceUnavailable("capture thread panicked".to_string()))?;
        tracing::debug!("audio capture stopped");
        Ok(())
    }
}

impl DeviceStream for CpalStream {
    fn start(
        &mut self,
        format: AudioFormat,
        slice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let config = self.config.clone();

        let thread = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run_capture(&config, format, slice, &chunks, &stop, &ready_tx)
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop, thread });
                tracing::debug!(format = format.mime, "audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::DeviceUnavailable(
                "capture thread exited before starting".to_string(),
            )),
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.join_worker()
    }

    fn release(&mut self) -> Result<()> {
        self.join_worker()
    }
}

fn run_capture(
    config: &StreamConfig,
    format: AudioFormat,
    slice: Duration,
    chunks: &mpsc::UnboundedSender<Vec<u8>>,
    stop: &AtomicBool,
    ready: &std_mpsc::Sender<Result<()>>,
) {
    let samples = Arc::new(Mutex::new(Vec::<f32>::new()));

    let mut stream = match build_input_stream(config, Arc::clone(&samples)) {
        Ok(stream) => Some(stream),
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut encoder = ChunkEncoder::new(format, config.sample_rate.0);
    loop {
        let stopping = stop.load(Ordering::Acquire);
        if stopping {
            // Drop the stream first so no samples land after the final drain
            drop(stream.take());
        } else {
            std::thread::sleep(slice);
        }

        let drained = samples
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();

        if let Some(chunk) = encoder.encode(&drained) {
            if chunks.send(chunk).is_err() {
                break;
            }
        }

        if stopping {
            break;
        }
    }
}

fn build_input_stream(config: &StreamConfig, samples: Arc<Mutex<Vec<f32>>>) -> Result<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device".to_string()))?;

    let channels = usize::from(config.channels.max(1));

    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = samples.lock() {
                    if channels == 1 {
                        buf.extend_from_slice(data);
                    } else {
                        #[allow(clippy::cast_precision_loss)]
                        buf.extend(
                            data.chunks(channels)
                                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                        );
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

/// Turns drained samples into chunks of the negotiated format
struct ChunkEncoder {
    format: AudioFormat,
    sample_rate: u32,
    header_sent: bool,
}

impl ChunkEncoder {
    const fn new(format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            format,
            sample_rate,
            header_sent: false,
        }
    }

    fn encode(&mut self, samples: &[f32]) -> Option<Vec<u8>> {
        let mut chunk = Vec::new();
        if self.format == AudioFormat::WAV && !self.header_sent {
            match samples_to_wav(&[], self.sample_rate) {
                Ok(header) => chunk.extend_from_slice(&header),
                Err(e) => tracing::warn!(error = %e, "failed to write wav header"),
            }
            self.header_sent = true;
        }
        chunk.extend(pcm16_bytes(samples));
        (!chunk.is_empty()).then_some(chunk)
    }
}

/// Convert f32 samples to 16-bit little-endian PCM
#[must_use]
pub fn pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            sample_i16.to_le_bytes()
        })
        .collect()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
