//! Realtime session behavior against a scripted mock endpoint.
//!
//! A real `tokio_tungstenite::accept_async` server plays the conversational
//! endpoint: the test reads the client events the session sends and pushes
//! scripted server events back, then observes the hooks, transcripts and
//! teardown the session produces. The key regression here is ordering: a
//! farewell transcript can land while the response's audio is still
//! streaming, and teardown must wait for `response.audio.done`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voicebridge::config::{BridgeConfig, VadSettings};
use voicebridge::core::call::CallHandle;
use voicebridge::core::realtime::{RealtimeSession, SessionEvents, SessionSettings};
use voicebridge::core::registry::CallRegistry;
use voicebridge::core::rtp::receiver::RtpSource;
use voicebridge::core::rtp::{RtpReceiver, RtpSender, packet};
use voicebridge::core::{AriEvent, ChannelControl, Orchestrator};
use voicebridge::{BridgeError, BridgeResult};

// =============================================================================
// Mock realtime server
// =============================================================================

/// One-connection mock endpoint. Client events come out of `client_events`;
/// JSON pushed into `push` goes to the client.
struct MockRealtimeServer {
    url: String,
    client_events: mpsc::Receiver<Value>,
    push: mpsc::Sender<String>,
}

impl MockRealtimeServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (event_tx, client_events) = mpsc::channel(64);
        let (push, mut push_rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => return,
            };
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                if event_tx.send(value).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    },
                    outbound = push_rx.recv() => match outbound {
                        Some(text) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            url: format!("ws://{addr}"),
            client_events,
            push,
        }
    }

    /// Wait for the next client event of the given type, skipping others
    /// (audio appends interleave with everything).
    async fn expect(&mut self, event_type: &str) -> Value {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.client_events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
                .expect("client connection gone");
            if event["type"] == event_type {
                return event;
            }
        }
    }

    /// Consume the session's opening handshake.
    async fn expect_handshake(&mut self) {
        self.expect("session.update").await;
        self.expect("conversation.item.create").await;
        self.expect("response.create").await;
    }

    async fn send(&self, event: Value) {
        self.push.send(event.to_string()).await.unwrap();
    }
}

fn transcript_done(text: &str) -> Value {
    json!({"type": "response.audio_transcript.done", "transcript": text})
}

fn audio_delta(payload: &[u8]) -> Value {
    json!({"type": "response.audio.delta", "delta": BASE64_STANDARD.encode(payload)})
}

fn audio_done() -> Value {
    json!({"type": "response.audio.done"})
}

// =============================================================================
// Recording hooks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Hook {
    Redirect(String),
    Terminate(String),
    SessionError,
}

#[derive(Default)]
struct RecordingHooks {
    events: Mutex<Vec<Hook>>,
}

impl RecordingHooks {
    fn snapshot(&self) -> Vec<Hook> {
        self.events.lock().clone()
    }

    fn terminate_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|h| matches!(h, Hook::Terminate(_)))
            .count()
    }

    async fn wait_for(&self, wanted: &Hook, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.events.lock().iter().any(|h| h == wanted) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("hook {wanted:?} never fired; saw {:?}", self.snapshot());
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl SessionEvents for RecordingHooks {
    async fn on_redirect_request(&self, _call_id: &str, phrase: &str) {
        self.events.lock().push(Hook::Redirect(phrase.to_string()));
    }

    async fn on_terminate_request(&self, _call_id: &str, phrase: &str) {
        self.events.lock().push(Hook::Terminate(phrase.to_string()));
    }

    async fn on_session_error(&self, _call_id: &str, _message: &str) {
        self.events.lock().push(Hook::SessionError);
    }
}

// =============================================================================
// Session harness
// =============================================================================

struct SessionHarness {
    session: RealtimeSession,
    hooks: Arc<RecordingHooks>,
    audio_tx: mpsc::Sender<Bytes>,
    transcript_path: PathBuf,
    _tempdir: tempfile::TempDir,
}

async fn start_session(
    server_url: &str,
    terminate_phrases: &[&str],
    redirect_phrases: &[&str],
) -> SessionHarness {
    let tempdir = tempfile::tempdir().unwrap();
    let registry = Arc::new(CallRegistry::new());

    let receiver = RtpReceiver::bind("C1", 0).await.unwrap();
    let rtp_source: RtpSource = Arc::new(Mutex::new(None));
    let sender = RtpSender::new("C1", rtp_source.clone()).await.unwrap();
    let transcript =
        voicebridge::core::transcript::TranscriptWriter::new(tempdir.path()).open("+49123", "C1");
    registry.insert(Arc::new(CallHandle::new(
        "C1",
        "+49123".into(),
        "bridge-1".into(),
        receiver.port(),
        rtp_source,
        sender.clone(),
        receiver,
        transcript.clone(),
    )));

    let settings = SessionSettings {
        url: server_url.to_string(),
        api_key: "sk-test".into(),
        model: "gpt-4o-realtime-preview".into(),
        voice: "alloy".into(),
        instructions: "be brief".into(),
        initial_message: "Hi".into(),
        transcription_model: "whisper-1".into(),
        transcription_language: "en".into(),
        vad: VadSettings::SemanticVad,
        silence_padding_ms: 100,
        terminate_phrases: terminate_phrases.iter().map(|p| p.to_string()).collect(),
        redirect_phrases: redirect_phrases.iter().map(|p| p.to_string()).collect(),
        max_retries: 3,
        retry_delay: Duration::from_millis(100),
    };
    let hooks = Arc::new(RecordingHooks::default());
    let hook_seam: Arc<dyn SessionEvents> = hooks.clone();
    let session = RealtimeSession::new(
        "C1",
        settings,
        sender,
        transcript.clone(),
        hook_seam,
        registry,
    );
    let (audio_tx, audio_rx) = mpsc::channel(64);
    session.spawn(audio_rx);

    SessionHarness {
        session,
        hooks,
        audio_tx,
        transcript_path: transcript.path().to_path_buf(),
        _tempdir: tempdir,
    }
}

// =============================================================================
// Session-level tests
// =============================================================================

#[tokio::test]
async fn terminate_phrase_arms_but_finalize_waits_for_audio_done() {
    let mut server = MockRealtimeServer::start().await;
    let harness = start_session(&server.url, &["goodbye"], &[]).await;
    server.expect_handshake().await;

    // The farewell transcript lands while the response's audio is still
    // streaming.
    server.send(transcript_done("Thanks, goodbye!")).await;
    server.send(audio_delta(&[0x55; 320])).await;

    sleep(Duration::from_millis(400)).await;
    assert_eq!(
        harness.hooks.terminate_count(),
        0,
        "terminate dispatched before response.audio.done: {:?}",
        harness.hooks.snapshot()
    );

    server.send(audio_delta(&[0x55; 320])).await;
    server.send(audio_done()).await;
    harness
        .hooks
        .wait_for(&Hook::Terminate("goodbye".into()), Duration::from_secs(2))
        .await;
}

#[tokio::test]
async fn redirect_phrase_dispatches_immediately() {
    let mut server = MockRealtimeServer::start().await;
    let harness = start_session(&server.url, &["goodbye"], &["connecting you"]).await;
    server.expect_handshake().await;

    server
        .send(transcript_done(
            "Okay, connecting you to the technical department",
        ))
        .await;
    // No audio.done needed for a handoff.
    harness
        .hooks
        .wait_for(
            &Hook::Redirect("connecting you".into()),
            Duration::from_secs(2),
        )
        .await;
    assert_eq!(harness.hooks.terminate_count(), 0);
}

#[tokio::test]
async fn error_with_armed_termination_still_finalizes() {
    let mut server = MockRealtimeServer::start().await;
    let harness = start_session(&server.url, &["goodbye"], &[]).await;
    server.expect_handshake().await;

    server.send(transcript_done("Alright, goodbye!")).await;
    server
        .send(json!({
            "type": "error",
            "error": {"type": "server_error", "message": "boom"}
        }))
        .await;

    harness
        .hooks
        .wait_for(&Hook::Terminate("goodbye".into()), Duration::from_secs(2))
        .await;
    harness
        .hooks
        .wait_for(&Hook::SessionError, Duration::from_secs(2))
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !harness.session.is_closed() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session did not close after error event"
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn caller_audio_is_forwarded_as_base64_appends() {
    let mut server = MockRealtimeServer::start().await;
    let harness = start_session(&server.url, &[], &[]).await;
    server.expect_handshake().await;

    harness
        .audio_tx
        .send(Bytes::from_static(&[1, 2, 3, 4]))
        .await
        .unwrap();
    let append = server.expect("input_audio_buffer.append").await;
    let decoded = BASE64_STANDARD
        .decode(append["audio"].as_str().unwrap())
        .unwrap();
    assert_eq!(decoded, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn both_sides_land_in_the_transcript_file() {
    let mut server = MockRealtimeServer::start().await;
    let harness = start_session(&server.url, &[], &[]).await;
    server.expect_handshake().await;

    server
        .send(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "hello there"
        }))
        .await;
    server.send(transcript_done("hi, how can I help?")).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(content) = tokio::fs::read_to_string(&harness.transcript_path).await {
            if content.lines().count() >= 2 {
                let lines: Vec<&str> = content.lines().collect();
                assert!(lines[0].contains(" USER: hello there"));
                assert!(lines[1].contains(" ASSISTANT: hi, how can I help?"));
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transcript lines never appeared"
        );
        sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// End-to-end: orchestrator + session against the mock endpoint
// =============================================================================

struct NullControl {
    hangups: Mutex<Vec<String>>,
}

#[async_trait]
impl ChannelControl for NullControl {
    async fn create_bridge(&self) -> BridgeResult<String> {
        Ok("bridge-1".to_string())
    }

    async fn destroy_bridge(&self, _bridge_id: &str) -> BridgeResult<()> {
        Ok(())
    }

    async fn add_channel(&self, _bridge_id: &str, _channel_id: &str) -> BridgeResult<()> {
        Ok(())
    }

    async fn answer(&self, _channel_id: &str) -> BridgeResult<()> {
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> BridgeResult<()> {
        self.hangups.lock().push(channel_id.to_string());
        Ok(())
    }

    async fn external_media(&self, _external_host: &str) -> BridgeResult<String> {
        Ok("ext-1".to_string())
    }

    async fn continue_in_dialplan(
        &self,
        _channel_id: &str,
        context: &str,
        _extension: &str,
        _priority: i32,
    ) -> BridgeResult<()> {
        Err(BridgeError::Control(format!("no such context {context}")))
    }
}

fn e2e_config(realtime_url: &str) -> BridgeConfig {
    BridgeConfig {
        ari_url: "http://127.0.0.1:8088/ari".into(),
        ari_username: "ari".into(),
        ari_password: "secret".into(),
        ari_app: "voicebridge".into(),
        openai_api_key: "sk-test".into(),
        realtime_url: realtime_url.into(),
        realtime_model: "gpt-4o-realtime-preview".into(),
        voice: "alloy".into(),
        system_prompt: "be brief".into(),
        initial_message: "Hi".into(),
        transcription_model: "whisper-1".into(),
        transcription_language: "en".into(),
        vad: VadSettings::SemanticVad,
        rtp_port_start: 24000,
        max_concurrent_calls: 4,
        silence_padding_ms: 100,
        redirection_queue: None,
        redirection_queue_context: None,
        redirection_phrases: Vec::new(),
        agent_terminate_phrases: vec!["goodbye".into()],
        recordings_dir: std::env::temp_dir().join("voicebridge-tests"),
        call_duration_limit: None,
        cleanup_grace: Duration::from_millis(1500),
        terminate_fallback: Duration::from_millis(3000),
        termination_watchdog: Duration::from_millis(8000),
        shutdown_timeout: Duration::from_millis(8000),
        health_port: 0,
        email: None,
    }
}

/// The full path of scenario three: the farewell transcript arrives while
/// its audio is still streaming, and the call is only cleaned up after
/// `response.audio.done` plus the playback drain.
#[tokio::test]
async fn call_cleanup_waits_for_the_farewell_audio() {
    let mut server = MockRealtimeServer::start().await;
    let control = Arc::new(NullControl {
        hangups: Mutex::new(Vec::new()),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(e2e_config(&server.url)),
        control.clone(),
        None,
    ));

    orchestrator
        .handle_event(AriEvent::StasisStart {
            channel: voicebridge::core::ari::events::Channel {
                id: "C1".into(),
                name: "PJSIP/trunk-00000001".into(),
                state: "Ring".into(),
                caller: None,
                connected: None,
            },
            args: Vec::new(),
        })
        .await;
    server.expect_handshake().await;

    // Teach the media path its peer so playback can actually drain.
    let handle = orchestrator.registry().get("C1").unwrap();
    let pbx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rtp = packet::RtpHeader {
        sequence: 1,
        timestamp: 160,
        ssrc: 7,
    }
    .encode(&[0x55; 160]);
    pbx.send_to(&rtp, ("127.0.0.1", handle.rtp_port))
        .await
        .unwrap();

    // Farewell transcript first; audio keeps streaming after it.
    server.send(transcript_done("Thanks, goodbye!")).await;
    server.send(audio_delta(&[0x55; 160 * 5])).await;

    sleep(Duration::from_millis(400)).await;
    assert!(
        orchestrator.registry().contains("C1"),
        "call cleaned up before response.audio.done"
    );
    assert!(control.hangups.lock().is_empty());

    server.send(audio_delta(&[0x55; 160 * 5])).await;
    server.send(audio_done()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orchestrator.registry().contains("C1") {
        assert!(
            tokio::time::Instant::now() < deadline,
            "call never cleaned up after response.audio.done"
        );
        sleep(Duration::from_millis(50)).await;
    }
    assert!(orchestrator.registry().is_cleaned("C1"));
    assert_eq!(
        control.hangups.lock().iter().filter(|id| *id == "C1").count(),
        1
    );
}
