use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use quote_voice::voice::tones::{self, CueKind, OutputFactory, ToneEngine};
use quote_voice::voice::{
    AudioBuffer, AudioFormat, AudioOutput, AudioSource, CaptureConstraints, CaptureHandle,
    CpalOutput, CpalSource, RemoteTranscriber, Transcriber,
};
use quote_voice::{Config, Preference, VoiceBackends, VoiceController, VoiceEvent};

/// Quote Voice - voice capture diagnostics for the quoting app
#[derive(Parser)]
#[command(name = "quote-voice", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/quote-voice/config.toml)
    #[arg(short, long, env = "QUOTE_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// API key for remote transcription
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Play every feedback tone
    TestTones,
    /// Transcribe an audio file with the remote service
    Transcribe {
        /// Audio file (wav, webm, ogg, mp4)
        path: PathBuf,
    },
    /// Dictate from the microphone; Enter toggles recording, q quits
    Dictate {
        /// Strategy preference (auto, streaming, buffered, realtime)
        #[arg(short, long)]
        preference: Option<Preference>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,quote_voice=info",
        1 => "info,quote_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).with_api_key(cli.api_key);
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestTones => test_tones(&config).await,
        Command::Transcribe { path } => transcribe(&config, &path).await,
        Command::Dictate { preference } => dictate(config, preference).await,
    }
}

/// Show a level meter for each second of microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let source = CpalSource::new(config.capture.sample_rate);
    let stream = source
        .acquire(&CaptureConstraints::from(&config.capture))
        .await?;
    let mut handle = CaptureHandle::new(stream);
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.start(AudioFormat::PCM16, Duration::from_secs(1), tx)?;

    println!("Sample rate: {} Hz", config.capture.sample_rate);
    println!("---");

    for i in 0..duration {
        let Some(chunk) = rx.recv().await else {
            break;
        };
        let samples = pcm16_samples(&chunk);
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    handle.release();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

fn pcm16_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / f32::from(i16::MAX))
        .collect()
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

fn tone_engine(config: &Config) -> ToneEngine {
    let factory: OutputFactory =
        Box::new(|| Ok(Arc::new(CpalOutput::new()?) as Arc<dyn AudioOutput>));
    ToneEngine::new(factory).with_volume(config.tones.volume)
}

/// Play each feedback cue in turn
async fn test_tones(config: &Config) -> anyhow::Result<()> {
    println!("Testing feedback tones...\n");

    let engine = tone_engine(config);
    for kind in [
        CueKind::ListeningStarted,
        CueKind::ListeningEnded,
        CueKind::Thinking,
        CueKind::Success,
        CueKind::Error,
    ] {
        println!("Playing {kind:?}");
        engine.play(kind).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    engine.shutdown();

    println!("\n---");
    println!("If you heard five cues, your speakers are working!");
    Ok(())
}

/// Upload a file to the transcription service
async fn transcribe(config: &Config, path: &Path) -> anyhow::Result<()> {
    let Some(credential) = config.api_key.as_ref() else {
        anyhow::bail!("an API key is required (--api-key or OPENAI_API_KEY)");
    };

    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("webm") => AudioFormat::WEBM,
        Some("ogg") => AudioFormat::OGG_OPUS,
        Some("mp4" | "m4a") => AudioFormat::MP4,
        _ => AudioFormat::WAV,
    };
    let bytes = tokio::fs::read(path).await?;
    let buffer = AudioBuffer::from_chunks(format, vec![bytes]);
    println!("Transcribing {} ({} bytes)...", path.display(), buffer.len());

    let transcriber = RemoteTranscriber::new(&config.transcription);
    let text = transcriber.transcribe(buffer, credential).await?;
    println!("\n{text}");
    Ok(())
}

/// Interactive dictation through the controller
async fn dictate(mut config: Config, preference: Option<Preference>) -> anyhow::Result<()> {
    if let Some(preference) = preference {
        config.preference = preference;
    }

    if !tones::init(tone_engine(&config)) {
        tracing::debug!("tone engine already registered");
    }
    let backends = VoiceBackends {
        audio: Some(Arc::new(CpalSource::new(config.capture.sample_rate))),
        ..VoiceBackends::default()
    };
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let controller = VoiceController::new(&config, backends, events_tx);
    println!("{}", controller.status_text());
    let (handle, task) = controller.spawn();

    println!("Press Enter to start or stop recording, q then Enter to quit.\n");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "q" => break,
                Some(_) => {
                    let state = handle.activate().await?;
                    tracing::debug!(?state, "control toggled");
                }
                None => break,
            },
            Some(event) = events.recv() => print_event(&event),
        }
    }

    handle.shutdown()?;
    task.await?;
    tones::shutdown();
    Ok(())
}

fn print_event(event: &VoiceEvent) {
    match event {
        VoiceEvent::Interim { text } => println!("... {text}"),
        VoiceEvent::Transcript { text } => println!(">>> {text}"),
        VoiceEvent::Response { text } => println!("<<< {text}"),
        VoiceEvent::Actions { actions } => {
            for action in actions {
                println!("[action] {} {}", action.name, action.arguments);
            }
        }
        VoiceEvent::State { state } => println!("[{state:?}]"),
        VoiceEvent::Error { message, .. } => println!("[error] {message}"),
    }
}
