//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use serde_json::json;
use tokio::sync::mpsc;

use quote_voice::voice::tones::{CueKind, ToneEngine};
use quote_voice::voice::{
    AdapterEvent, AdapterPhase, Alternative, AudioBuffer, AudioFormat, AudioOutput,
    BufferedRecorder, Capabilities, ChannelTransport, ClientEvent, EngineEvent, PermissionGate,
    PermissionState, RealtimeState, RealtimeVoice, RecognitionResult, RecordingState, RemoteEnd,
    RemoteTranscriber, ResultBatch, SAMPLE_RATE, ServerError, ServerEvent, SessionSettings,
    VoiceAdapter, samples_to_wav, select_strategy,
};
use quote_voice::{
    Config, Error, Preference, PresentationState, Strategy, VoiceBackends, VoiceController,
    VoiceEvent,
};

mod common;

use common::{FakeAudioSource, FakeEngine, FakeOutput, FakeTranscriber, chunk, credential};

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

fn config_with_key() -> Config {
    Config {
        api_key: Some(credential()),
        ..Config::default()
    }
}

fn batch(text: &str, is_final: bool) -> EngineEvent {
    EngineEvent::Result(ResultBatch {
        result_index: 0,
        results: vec![RecognitionResult {
            is_final,
            alternatives: vec![Alternative {
                transcript: text.to_string(),
                confidence: 0.92,
            }],
        }],
    })
}

fn drain(events: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> Vec<VoiceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn transcripts(events: &[VoiceEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Transcript { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Apply the next adapter event, failing if none arrives
async fn step(controller: &mut VoiceController) {
    tokio::time::timeout(Duration::from_secs(2), controller.process_next())
        .await
        .expect("no adapter event");
}

/// Serve the transcription endpoint with a fixed response
async fn spawn_transcription_server(
    status: StatusCode,
    body: serde_json::Value,
    hits: Arc<AtomicUsize>,
) -> String {
    let app = Router::new().route(
        "/v1/audio/transcriptions",
        post(move |headers: HeaderMap, payload: axum::body::Bytes| {
            let body = body.clone();
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer sk-test");
                let payload = String::from_utf8_lossy(&payload);
                let well_formed =
                    payload.contains("whisper-1") && payload.contains("name=\"file\"");
                if !authorized || !well_formed {
                    return (
                        StatusCode::BAD_REQUEST,
                        axum::Json(json!({"error": {"message": "bad request"}})),
                    );
                }
                (status, axum::Json(body))
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

#[test]
fn test_strategy_selection_scenarios() {
    // A: everything available, automatic
    let caps = Capabilities {
        streaming_available: true,
        buffered_capture_available: true,
        remote_key_present: true,
        realtime_available: false,
    };
    assert_eq!(
        select_strategy(Preference::Auto, &caps).unwrap(),
        Strategy::Streaming
    );

    // B: no native recognizer
    let caps = Capabilities {
        streaming_available: false,
        ..caps
    };
    assert_eq!(
        select_strategy(Preference::Auto, &caps).unwrap(),
        Strategy::Buffered
    );

    // C: capture but no credential
    let caps = Capabilities {
        remote_key_present: false,
        ..caps
    };
    assert!(matches!(
        select_strategy(Preference::Auto, &caps),
        Err(Error::Unsupported)
    ));
}

#[test]
fn test_strategy_selection_is_deterministic() {
    let prefs = [
        Preference::Auto,
        Preference::Streaming,
        Preference::Buffered,
        Preference::Realtime,
    ];
    for bits in 0u8..16 {
        let caps = Capabilities {
            streaming_available: bits & 1 != 0,
            buffered_capture_available: bits & 2 != 0,
            remote_key_present: bits & 4 != 0,
            realtime_available: bits & 8 != 0,
        };
        for pref in prefs {
            let first = select_strategy(pref, &caps).ok();
            let second = select_strategy(pref, &caps).ok();
            assert_eq!(first, second);

            match first {
                Some(Strategy::Streaming) => assert!(caps.streaming_available),
                Some(Strategy::Buffered) => {
                    assert!(caps.buffered_capture_available && caps.remote_key_present);
                }
                Some(Strategy::Realtime) => {
                    assert_eq!(pref, Preference::Realtime);
                    assert!(caps.realtime_available && caps.remote_key_present);
                }
                None => assert!(
                    !caps.streaming_available
                        && !(caps.buffered_capture_available && caps.remote_key_present)
                ),
            }
        }
    }
}

#[tokio::test]
async fn test_scenario_c_controller_unsupported() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        audio: Some(Arc::new(FakeAudioSource::new(Vec::new()))),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&Config::default(), backends, tx);

    assert_eq!(controller.strategy(), None);
    assert_eq!(controller.activate().await, PresentationState::Unsupported);
    assert_eq!(controller.status_text(), "Voice input unavailable");
    assert!(transcripts(&drain(&mut rx)).is_empty());

    // Nothing to drive
    let mut next = tokio_test::task::spawn(controller.process_next());
    tokio_test::assert_pending!(next.poll());
}

#[tokio::test]
async fn test_idle_recorder_has_no_events() {
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let transcriber = Arc::new(FakeTranscriber::returning("unused"));
    let mut recorder = BufferedRecorder::new(source, transcriber, &config_with_key());

    let mut next = tokio_test::task::spawn(recorder.next_event());
    tokio_test::assert_pending!(next.poll());
}

#[tokio::test]
async fn test_scenario_d_permission_declined() {
    let source = Arc::new(FakeAudioSource::denying());
    let counters = source.counters();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        audio: Some(source),
        transcriber: Some(Arc::new(FakeTranscriber::returning("unused"))),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&config_with_key(), backends, tx);
    assert_eq!(controller.strategy(), Some(Strategy::Buffered));

    assert_eq!(
        controller.activate().await,
        PresentationState::PermissionDenied
    );
    assert_eq!(controller.permission_state(), PermissionState::Denied);
    assert_eq!(counters.live(), 0);

    let events = drain(&mut rx);
    assert!(events.contains(&VoiceEvent::Error {
        message: "Microphone access denied".to_string(),
        recoverable: false,
    }));
    assert!(events.contains(&VoiceEvent::State {
        state: PresentationState::PermissionDenied
    }));

    // Inert while denied
    assert_eq!(
        controller.activate().await,
        PresentationState::PermissionDenied
    );
    assert_eq!(counters.acquired(), 0);
}

#[tokio::test]
async fn test_scenario_e_stop_without_credential_keeps_buffer() {
    let source = Arc::new(FakeAudioSource::new(vec![chunk(1), chunk(2), chunk(3)]));
    let counters = source.counters();
    let transcriber = Arc::new(FakeTranscriber::returning("unused"));
    let mut recorder =
        BufferedRecorder::new(source, transcriber.clone(), &Config::default());

    assert!(!recorder.has_credential());
    recorder.start_recording().await.unwrap();
    assert_eq!(recorder.state(), RecordingState::Recording);

    let text = recorder.stop_recording().await.unwrap();
    assert_eq!(text, "");
    assert_eq!(recorder.state(), RecordingState::Idle);
    assert_eq!(transcriber.calls(), 0);
    assert_eq!(counters.live(), 0);

    let buffer = recorder.take_pending_buffer().expect("recording kept");
    assert_eq!(buffer.format(), AudioFormat::WEBM_OPUS);
    assert_eq!(buffer.len(), 3 * 160);
    assert_eq!(&buffer.bytes()[..160], chunk(1).as_slice());
    assert_eq!(&buffer.bytes()[320..], chunk(3).as_slice());
    assert!(recorder.take_pending_buffer().is_none());

    // Explicit transcription still needs a key
    assert!(matches!(
        recorder.transcribe_audio(buffer).await,
        Err(Error::MissingCredential)
    ));
}

#[tokio::test]
async fn test_scenario_f_unauthorized_upload() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_transcription_server(
        StatusCode::UNAUTHORIZED,
        json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}}),
        Arc::clone(&hits),
    )
    .await;

    let mut config = config_with_key();
    config.transcription.base_url = base_url;
    let source = Arc::new(FakeAudioSource::new(vec![chunk(7), chunk(8)]));
    let counters = source.counters();
    let transcriber = Arc::new(RemoteTranscriber::new(&config.transcription));
    let mut recorder = BufferedRecorder::new(source, transcriber, &config);

    recorder.start_recording().await.unwrap();
    let err = recorder.stop_recording().await.unwrap_err();

    match err {
        Error::RemoteServiceError { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Incorrect API key provided");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(counters.live(), 0);
    assert_eq!(recorder.state(), RecordingState::Error);
    assert!(matches!(
        recorder.last_error(),
        Some(Error::RemoteServiceError { status: 401, .. })
    ));
}

#[tokio::test]
async fn test_remote_transcription_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_transcription_server(
        StatusCode::OK,
        json!({"text": "Remplacement du ballon d'eau chaude"}),
        Arc::clone(&hits),
    )
    .await;

    let mut config = config_with_key();
    config.transcription.base_url = base_url;
    let source = Arc::new(FakeAudioSource::new(vec![chunk(1)]));
    let transcriber = Arc::new(RemoteTranscriber::new(&config.transcription));
    let mut recorder = BufferedRecorder::new(source, transcriber, &config);

    recorder.start_recording().await.unwrap();
    let text = recorder.stop_recording().await.unwrap();
    assert_eq!(text, "Remplacement du ballon d'eau chaude");
    assert_eq!(recorder.state(), RecordingState::Idle);
}

#[tokio::test]
async fn test_redundant_start_keeps_one_session() {
    let source = Arc::new(FakeAudioSource::new(vec![chunk(1)]));
    let counters = source.counters();
    let transcriber = Arc::new(FakeTranscriber::returning("ok"));
    let mut recorder = BufferedRecorder::new(source, transcriber, &config_with_key());

    recorder.start_recording().await.unwrap();
    recorder.start_recording().await.unwrap();
    assert_eq!(counters.acquired(), 1);
    assert_eq!(counters.live(), 1);

    recorder.cancel_recording();
    assert_eq!(counters.live(), 0);
    assert_eq!(recorder.state(), RecordingState::Idle);
    assert!(recorder.take_pending_buffer().is_none());
}

#[tokio::test]
async fn test_stop_releases_device_when_transcription_fails() {
    let source = Arc::new(FakeAudioSource::new(vec![chunk(1), chunk(2)]));
    let counters = source.counters();
    let transcriber = Arc::new(FakeTranscriber::failing(Error::NetworkFailure(
        "connection reset".to_string(),
    )));
    let mut recorder = BufferedRecorder::new(source, transcriber.clone(), &config_with_key());

    recorder.start_recording().await.unwrap();
    let err = recorder.stop_recording().await.unwrap_err();
    assert!(matches!(err, Error::NetworkFailure(_)));
    assert_eq!(counters.live(), 0);
    assert_eq!(transcriber.calls(), 1);

    // Recoverable: a new recording starts from a fresh buffer
    recorder.start_recording().await.unwrap();
    assert_eq!(recorder.state(), RecordingState::Recording);
    assert!(recorder.last_error().is_none());
}

#[tokio::test]
async fn test_empty_recording_skips_service() {
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let transcriber = Arc::new(FakeTranscriber::returning("should not be called"));
    let mut recorder = BufferedRecorder::new(source, transcriber.clone(), &config_with_key());

    recorder.start_recording().await.unwrap();
    assert_eq!(recorder.stop_recording().await.unwrap(), "");
    assert_eq!(transcriber.calls(), 0);
}

#[tokio::test]
async fn test_streaming_controller_forwards_final_once() {
    let (engine, remote) = FakeEngine::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        engine: Some(Box::new(engine)),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&Config::default(), backends, tx);
    assert_eq!(controller.strategy(), Some(Strategy::Streaming));

    assert_eq!(controller.activate().await, PresentationState::Active);
    assert_eq!(controller.status_text(), "Listening...");

    remote.emit(batch("deux", false));
    step(&mut controller).await;
    remote.emit(batch("deux robinets", false));
    step(&mut controller).await;
    remote.emit(batch("deux robinets thermostatiques", true));
    step(&mut controller).await;
    step(&mut controller).await;

    // Stop is graceful; the end acknowledgment returns to idle
    assert_eq!(controller.activate().await, PresentationState::Active);
    step(&mut controller).await;
    assert_eq!(controller.presentation_state(), PresentationState::Idle);

    let events = drain(&mut rx);
    assert_eq!(transcripts(&events), vec!["deux robinets thermostatiques"]);
    let interims: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Interim { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(interims, vec!["deux", "deux robinets", ""]);
    assert_eq!(
        events.last(),
        Some(&VoiceEvent::State {
            state: PresentationState::Idle
        })
    );
    assert_eq!(remote.starts(), 1);
}

#[tokio::test]
async fn test_streaming_permission_refusal_disables_control() {
    let (engine, remote) = FakeEngine::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        engine: Some(Box::new(engine)),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&Config::default(), backends, tx);

    controller.activate().await;
    remote.emit(EngineEvent::Error("not-allowed".to_string()));
    step(&mut controller).await;

    assert_eq!(
        controller.presentation_state(),
        PresentationState::PermissionDenied
    );
    assert!(drain(&mut rx).contains(&VoiceEvent::Error {
        message: "Microphone access denied".to_string(),
        recoverable: false,
    }));
}

#[tokio::test]
async fn test_buffered_controller_round_trip() {
    let source = Arc::new(FakeAudioSource::new(vec![chunk(1), chunk(2), chunk(3)]));
    let counters = source.counters();
    let transcriber = Arc::new(FakeTranscriber::returning("Poser un évier en inox"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        audio: Some(source),
        transcriber: Some(transcriber.clone()),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&config_with_key(), backends, tx);
    assert_eq!(controller.strategy(), Some(Strategy::Buffered));

    // First click asks for access, then records
    assert_eq!(controller.activate().await, PresentationState::Active);
    assert_eq!(controller.permission_state(), PermissionState::Granted);
    assert_eq!(counters.acquired(), 2);
    assert_eq!(counters.live(), 1);

    assert_eq!(controller.activate().await, PresentationState::Processing);
    assert_eq!(counters.live(), 0);

    // Stopped, Processing, then the transcript
    step(&mut controller).await;
    step(&mut controller).await;
    step(&mut controller).await;
    assert_eq!(controller.presentation_state(), PresentationState::Idle);

    let events = drain(&mut rx);
    assert_eq!(transcripts(&events), vec!["Poser un évier en inox"]);
    assert_eq!(transcriber.received_bytes.load(Ordering::SeqCst), 3 * 160);
}

#[tokio::test]
async fn test_credential_change_reselects_strategy() {
    let source = Arc::new(FakeAudioSource::new(vec![chunk(1)]));
    let counters = source.counters();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        audio: Some(source),
        transcriber: Some(Arc::new(FakeTranscriber::returning("ok"))),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&config_with_key(), backends, tx);
    controller.activate().await;
    assert_eq!(counters.live(), 1);

    // Dropping the key tears the live recording down
    controller.set_credential(None).await;
    assert_eq!(controller.strategy(), None);
    assert_eq!(counters.live(), 0);
    assert_eq!(
        controller.presentation_state(),
        PresentationState::Unsupported
    );

    controller.set_credential(Some(credential())).await;
    assert_eq!(controller.strategy(), Some(Strategy::Buffered));
    assert!(!controller.capabilities().streaming_available);

    let states: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            VoiceEvent::State { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            PresentationState::Active,
            PresentationState::Unsupported,
            PresentationState::Idle
        ]
    );
}

#[tokio::test]
async fn test_spawned_controller_handle() {
    let (engine, remote) = FakeEngine::new();
    let aborted = Arc::clone(&remote.aborted);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        engine: Some(Box::new(engine)),
        ..VoiceBackends::default()
    };
    let (handle, task) = VoiceController::new(&Config::default(), backends, tx).spawn();

    assert_eq!(handle.activate().await.unwrap(), PresentationState::Active);
    remote.emit(batch("trois prises électriques", true));

    let text = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(VoiceEvent::Transcript { text }) = rx.recv().await {
                return text;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(text, "trois prises électriques");

    handle.shutdown().unwrap();
    task.await.unwrap();
    assert!(aborted.load(Ordering::SeqCst));
    assert!(matches!(handle.activate().await, Err(Error::Aborted)));
}

#[tokio::test]
async fn test_permission_probe_releases_device() {
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let counters = source.counters();
    let mut gate = PermissionGate::new(source, Default::default());
    assert_eq!(gate.state(), PermissionState::Prompt);

    assert_eq!(gate.query_permission().await, PermissionState::Granted);
    assert_eq!(counters.acquired(), 1);
    assert_eq!(counters.live(), 0);

    let source = Arc::new(FakeAudioSource {
        permission: Some(PermissionState::Denied),
        ..FakeAudioSource::new(Vec::new())
    });
    let counters = source.counters();
    let mut gate = PermissionGate::new(source, Default::default());
    assert_eq!(gate.query_permission().await, PermissionState::Denied);
    assert_eq!(counters.acquired(), 0);
}

#[tokio::test]
async fn test_realtime_session_batches_actions() {
    let (transport, mut remote) = ChannelTransport::pair();
    remote.send(&ServerEvent::SessionCreated).unwrap();
    remote.send(&ServerEvent::SessionUpdated).unwrap();

    let source = Arc::new(FakeAudioSource::new(vec![vec![1, 0, 2, 0], vec![3, 0]]));
    let counters = source.counters();
    let mut voice = RealtimeVoice::new(Box::new(transport), source, None, &config_with_key());

    voice.start_listening().await.unwrap();
    assert_eq!(voice.state(), RealtimeState::Listening);
    assert!(matches!(
        remote.recv().await.unwrap().unwrap(),
        ClientEvent::SessionUpdate { .. }
    ));

    voice.stop_listening().await.unwrap();
    assert_eq!(voice.state(), RealtimeState::Processing);
    assert_eq!(counters.live(), 0);

    let mut sent = Vec::new();
    while let Ok(frame) = remote.outgoing.try_recv() {
        sent.push(serde_json::from_str::<ClientEvent>(&frame).unwrap());
    }
    assert_eq!(
        sent,
        vec![
            ClientEvent::AppendAudio {
                audio: "AQACAA==".to_string()
            },
            ClientEvent::AppendAudio {
                audio: "AwA=".to_string()
            },
            ClientEvent::CommitAudio,
            ClientEvent::CreateResponse,
        ]
    );

    for event in [
        ServerEvent::TranscriptionCompleted {
            transcript: "Le client s'appelle Dupont, ajoute deux heures".to_string(),
        },
        ServerEvent::FunctionCallDone {
            name: "set_client_name".to_string(),
            arguments: r#"{"name":"Dupont"}"#.to_string(),
            call_id: Some("call_1".to_string()),
        },
        ServerEvent::FunctionCallDone {
            name: "add_line".to_string(),
            arguments: r#"{"label":"Main d'oeuvre","hours":2}"#.to_string(),
            call_id: Some("call_2".to_string()),
        },
        ServerEvent::AudioTranscriptDone {
            transcript: "C'est noté.".to_string(),
        },
        ServerEvent::ResponseDone,
    ] {
        remote.send(&event).unwrap();
    }

    let mut received = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), voice.next_event())
            .await
            .unwrap();
        let done = event == AdapterEvent::Completed;
        received.push(event);
        if done {
            break;
        }
    }

    assert_eq!(received[0], AdapterEvent::Stopped);
    assert_eq!(received[1], AdapterEvent::Processing);
    assert!(matches!(&received[2], AdapterEvent::Final(t) if t.text.starts_with("Le client")));
    assert_eq!(received[3], AdapterEvent::Response("C'est noté.".to_string()));
    let AdapterEvent::Actions(actions) = &received[4] else {
        panic!("expected one action batch, got {:?}", received[4]);
    };
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].name, "set_client_name");
    assert_eq!(actions[1].arguments["hours"], 2);
    assert_eq!(received.len(), 6);
    assert_eq!(voice.state(), RealtimeState::Connected);

    voice.disconnect().await;
    voice.disconnect().await;
    assert_eq!(voice.state(), RealtimeState::Disconnected);
}

#[tokio::test]
async fn test_realtime_session_advertises_actions() {
    let config = config_with_key();
    let tool = json!({
        "type": "function",
        "name": "add_line",
        "parameters": {"type": "object", "properties": {"label": {"type": "string"}}}
    });
    let settings = SessionSettings::new(&config.realtime, &config.transcription.model)
        .with_tools(vec![tool.clone()]);

    let (transport, mut remote) = ChannelTransport::pair();
    remote.send(&ServerEvent::SessionUpdated).unwrap();
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let mut voice =
        RealtimeVoice::new(Box::new(transport), source, None, &config).with_settings(settings);

    voice.connect().await.unwrap();
    assert_eq!(voice.state(), RealtimeState::Connected);

    match remote.recv().await.unwrap().unwrap() {
        ClientEvent::SessionUpdate { session } => {
            assert_eq!(session.tools, vec![tool]);
            assert!(session.turn_detection.is_none());
        }
        other => panic!("unexpected first frame: {other:?}"),
    }
}

#[tokio::test]
async fn test_realtime_commit_failure_leaves_control_usable() {
    let (transport, remote) = ChannelTransport::pair();
    remote.send(&ServerEvent::SessionUpdated).unwrap();
    let source = Arc::new(FakeAudioSource::new(vec![vec![1, 0]]));
    let counters = source.counters();
    let mut voice = RealtimeVoice::new(Box::new(transport), source, None, &config_with_key());
    voice.start_listening().await.unwrap();

    // Host socket goes away mid-utterance
    let RemoteEnd {
        outgoing,
        incoming: _incoming,
    } = remote;
    drop(outgoing);

    assert!(matches!(
        voice.stop_listening().await,
        Err(Error::Realtime(_))
    ));
    assert_eq!(voice.state(), RealtimeState::Disconnected);
    assert_eq!(voice.phase(), AdapterPhase::Idle);
    assert!(!voice.is_live());
    assert_eq!(counters.live(), 0);

    // A further stop is harmless and does not wedge the session
    voice.stop().await.unwrap();
    assert_eq!(voice.phase(), AdapterPhase::Idle);
}

#[tokio::test]
async fn test_realtime_connection_lost_releases_device() {
    let (transport, remote) = ChannelTransport::pair();
    remote.send(&ServerEvent::SessionUpdated).unwrap();
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let counters = source.counters();
    let mut voice = RealtimeVoice::new(Box::new(transport), source, None, &config_with_key());
    voice.start_listening().await.unwrap();
    assert_eq!(counters.live(), 1);

    drop(remote);
    let event = tokio::time::timeout(Duration::from_secs(2), voice.next_event())
        .await
        .unwrap();

    assert_eq!(event, AdapterEvent::Failed);
    assert_eq!(voice.state(), RealtimeState::Disconnected);
    assert_eq!(counters.live(), 0);
    assert!(matches!(voice.last_error(), Some(Error::Realtime(_))));
}

#[tokio::test]
async fn test_realtime_controller_forwards_actions_once() {
    let (transport, mut remote) = ChannelTransport::pair();
    remote.send(&ServerEvent::SessionUpdated).unwrap();
    let source = Arc::new(FakeAudioSource::new(vec![vec![1, 0, 2, 0]]));
    let counters = source.counters();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = VoiceBackends {
        audio: Some(source),
        transcriber: Some(Arc::new(FakeTranscriber::returning("unused"))),
        realtime: Some(Box::new(transport)),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&config_with_key(), backends, tx);
    assert_eq!(controller.strategy(), Some(Strategy::Buffered));
    assert!(controller.capabilities().realtime_available);

    controller.set_preference(Preference::Realtime).await;
    assert_eq!(controller.strategy(), Some(Strategy::Realtime));

    assert_eq!(controller.activate().await, PresentationState::Active);
    assert_eq!(controller.activate().await, PresentationState::Processing);
    assert_eq!(controller.status_text(), "Thinking...");
    assert_eq!(counters.live(), 0);

    // Clicks are ignored while the response is pending
    assert_eq!(controller.activate().await, PresentationState::Processing);

    for event in [
        ServerEvent::TranscriptionCompleted {
            transcript: "Ajoute un mitigeur et une heure de pose".to_string(),
        },
        ServerEvent::FunctionCallDone {
            name: "add_line".to_string(),
            arguments: r#"{"label":"Mitigeur"}"#.to_string(),
            call_id: Some("call_1".to_string()),
        },
        ServerEvent::FunctionCallDone {
            name: "add_line".to_string(),
            arguments: r#"{"label":"Pose","hours":1}"#.to_string(),
            call_id: Some("call_2".to_string()),
        },
        ServerEvent::AudioTranscriptDone {
            transcript: "J'ajoute deux lignes.".to_string(),
        },
        ServerEvent::ResponseDone,
    ] {
        remote.send(&event).unwrap();
    }

    // Stopped, Processing, Final, Response, Actions, Completed
    for _ in 0..6 {
        step(&mut controller).await;
    }
    assert_eq!(controller.presentation_state(), PresentationState::Idle);

    let events = drain(&mut rx);
    assert_eq!(
        transcripts(&events),
        vec!["Ajoute un mitigeur et une heure de pose"]
    );
    let responses: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, VoiceEvent::Response { .. }))
        .collect();
    assert_eq!(
        responses,
        vec![&VoiceEvent::Response {
            text: "J'ajoute deux lignes.".to_string()
        }]
    );
    let batches: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Actions { actions } => Some(actions),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[0][1].arguments["hours"], 1);

    let mut sent = Vec::new();
    while let Ok(frame) = remote.outgoing.try_recv() {
        sent.push(serde_json::from_str::<ClientEvent>(&frame).unwrap());
    }
    assert!(matches!(sent[0], ClientEvent::SessionUpdate { .. }));
    assert_eq!(
        sent[1..],
        [
            ClientEvent::AppendAudio {
                audio: "AQACAA==".to_string()
            },
            ClientEvent::CommitAudio,
            ClientEvent::CreateResponse,
        ]
    );
}

#[tokio::test]
async fn test_realtime_error_while_speaking_recovers() {
    let (transport, remote) = ChannelTransport::pair();
    remote.send(&ServerEvent::SessionUpdated).unwrap();
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let output = Arc::new(FakeOutput::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut config = config_with_key();
    config.preference = Preference::Realtime;
    let backends = VoiceBackends {
        audio: Some(source),
        realtime: Some(Box::new(transport)),
        output: Some(output.clone()),
        ..VoiceBackends::default()
    };
    let mut controller = VoiceController::new(&config, backends, tx);
    assert_eq!(controller.strategy(), Some(Strategy::Realtime));

    controller.activate().await;
    assert_eq!(controller.activate().await, PresentationState::Processing);

    // Response audio starts, then the service fails the response
    remote
        .send(&ServerEvent::AudioDelta {
            delta: "AAABAA==".to_string(),
        })
        .unwrap();
    remote
        .send(&ServerEvent::Error {
            error: ServerError {
                message: "The server had an error while processing your request".to_string(),
                code: Some("server_error".to_string()),
            },
        })
        .unwrap();

    // Stopped, Processing, Failed
    for _ in 0..3 {
        step(&mut controller).await;
    }
    assert_eq!(*output.played.lock().unwrap(), vec![2]);
    assert_eq!(controller.presentation_state(), PresentationState::Idle);
    assert!(drain(&mut rx).contains(&VoiceEvent::Error {
        message: "Voice session interrupted".to_string(),
        recoverable: true,
    }));

    // The next click opens a new turn on the same session
    assert_eq!(controller.activate().await, PresentationState::Active);
    assert!(controller.last_error().is_none());
}

#[tokio::test]
async fn test_realtime_requires_credential() {
    let (transport, _remote) = ChannelTransport::pair();
    let source = Arc::new(FakeAudioSource::new(Vec::new()));
    let mut voice = RealtimeVoice::new(Box::new(transport), source, None, &Config::default());

    assert!(matches!(
        voice.connect().await,
        Err(Error::MissingCredential)
    ));
    assert_eq!(voice.state(), RealtimeState::Disconnected);
}

#[tokio::test]
async fn test_tone_context_created_once() {
    let created = Arc::new(AtomicUsize::new(0));
    let output = Arc::new(FakeOutput::default());

    let engine = ToneEngine::new(Box::new({
        let created = Arc::clone(&created);
        let output = Arc::clone(&output);
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&output) as Arc<dyn AudioOutput>)
        }
    }));
    assert!(!engine.is_initialized());

    engine.play(CueKind::ListeningStarted).await;
    engine.play(CueKind::Success).await;
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(engine.is_initialized());

    let played = output.played.lock().unwrap().clone();
    assert_eq!(played.len(), 2);
    assert!(played.iter().all(|n| *n > 0));

    engine.shutdown();
    assert!(output.closed.load(Ordering::SeqCst));
    assert!(!engine.is_initialized());
}

#[tokio::test]
async fn test_tone_failures_are_swallowed() {
    let engine = ToneEngine::new(Box::new(|| {
        Err(Error::DeviceUnavailable("no output device".to_string()))
    }));
    engine.play(CueKind::Error).await;
    assert!(!engine.is_initialized());
}

#[test]
fn test_split_wav_recording_is_readable() {
    let samples = generate_sine_samples(440.0, 0.3, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Header in the first chunk, audio in 100 ms slices after it
    let (header, data) = wav.split_at(44);
    let mut chunks = vec![header.to_vec()];
    chunks.extend(data.chunks(3200).map(<[u8]>::to_vec));

    let buffer = AudioBuffer::from_chunks(AudioFormat::WAV, chunks);
    assert!(!buffer.is_empty());

    let reader = hound::WavReader::new(Cursor::new(buffer.bytes())).unwrap();
    assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
    assert_eq!(reader.len() as usize, samples.len());
}
