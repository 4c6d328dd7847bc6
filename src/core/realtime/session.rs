//! Per-call realtime session.
//!
//! Owns the WebSocket to the conversational endpoint for one call. Caller
//! ulaw (from the RTP receiver) goes up as base64 appends; assistant audio
//! deltas are decoded and fed to the RTP sender; transcripts of both sides
//! are appended to the call's transcript file, and assistant transcripts are
//! matched against the configured trigger phrases.
//!
//! Trigger callbacks into the orchestrator are fire-and-forget with a
//! defensive call-id check on the receiving side; nothing the orchestrator
//! does in response may deadlock the reader, so hooks run on their own tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use super::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig,
    TurnDetection,
};
use crate::config::{BridgeConfig, VadSettings};
use crate::core::error::{BridgeError, BridgeResult};
use crate::core::registry::CallRegistry;
use crate::core::rtp::{RtpSender, packet};
use crate::core::transcript::{Speaker, TranscriptHandle};
use crate::utils::normalize_phrase;

/// How long `close` waits for the session task to settle before aborting it.
const CLOSE_SETTLE: Duration = Duration::from_millis(300);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session-to-orchestrator callbacks.
///
/// All methods are informational; the orchestrator decides what (if
/// anything) happens, re-checking its own per-call state.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    /// The assistant uttered a redirection phrase.
    async fn on_redirect_request(&self, call_id: &str, phrase: &str);
    /// A farewell phrase was uttered and its response finished streaming
    /// audio (or the session died with the farewell armed); terminate once
    /// playback drains.
    async fn on_terminate_request(&self, call_id: &str, phrase: &str);
    /// The session hit an unrecoverable error.
    async fn on_session_error(&self, call_id: &str, message: &str);
}

/// Per-call slice of the bridge configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub initial_message: String,
    pub transcription_model: String,
    pub transcription_language: String,
    pub vad: VadSettings,
    pub silence_padding_ms: u64,
    pub terminate_phrases: Vec<String>,
    pub redirect_phrases: Vec<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            url: config.realtime_url.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.realtime_model.clone(),
            voice: config.voice.clone(),
            instructions: config.system_prompt.clone(),
            initial_message: config.initial_message.clone(),
            transcription_model: config.transcription_model.clone(),
            transcription_language: config.transcription_language.clone(),
            vad: config.vad.clone(),
            silence_padding_ms: config.silence_padding_ms,
            terminate_phrases: config.agent_terminate_phrases.clone(),
            redirect_phrases: config.redirection_phrases.clone(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

struct SessionInner {
    call_id: String,
    settings: SessionSettings,
    sender: RtpSender,
    transcript: TranscriptHandle,
    hooks: Arc<dyn SessionEvents>,
    registry: Arc<CallRegistry>,
    closed: AtomicBool,
    shutdown: Notify,
    /// Farewell matched. Arming is all that happens at transcript time; the
    /// terminate hook fires only once the response's audio has finished
    /// streaming (or on an error path).
    terminate_armed: AtomicBool,
    /// The phrase that armed termination, carried into the hook.
    terminate_phrase: parking_lot::Mutex<Option<String>>,
    /// Prefix the next audio delta with silence padding (response start or
    /// after barge-in).
    pad_next_delta: AtomicBool,
    total_delta_bytes: AtomicU64,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Per-call realtime WebSocket client.
#[derive(Clone)]
pub struct RealtimeSession {
    inner: Arc<SessionInner>,
}

impl RealtimeSession {
    pub fn new(
        call_id: &str,
        settings: SessionSettings,
        sender: RtpSender,
        transcript: TranscriptHandle,
        hooks: Arc<dyn SessionEvents>,
        registry: Arc<CallRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                call_id: call_id.to_string(),
                settings,
                sender,
                transcript,
                hooks,
                registry,
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                terminate_armed: AtomicBool::new(false),
                terminate_phrase: parking_lot::Mutex::new(None),
                pad_next_delta: AtomicBool::new(true),
                total_delta_bytes: AtomicU64::new(0),
                task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Spawn the session task. `audio_rx` carries caller ulaw from the RTP
    /// receiver.
    pub fn spawn(&self, audio_rx: mpsc::Receiver<Bytes>) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { run(inner, audio_rx).await });
        *self.inner.task.lock() = Some(task);
    }

    /// Close the session, waiting briefly for the task to settle. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_SETTLE, task).await.is_err() {
                abort.abort();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Total assistant audio bytes received so far.
    pub fn total_delta_bytes(&self) -> u64 {
        self.inner.total_delta_bytes.load(Ordering::Relaxed)
    }
}

/// Connect-and-drive loop with bounded reconnects.
///
/// Retries only while the call is still registered; a retry after cleanup is
/// suppressed by the registry check.
async fn run(inner: Arc<SessionInner>, mut audio_rx: mpsc::Receiver<Bytes>) {
    let mut attempt = 0u32;
    loop {
        if inner.closed.load(Ordering::SeqCst) || !inner.registry.contains(&inner.call_id) {
            break;
        }
        match connect(&inner).await {
            Ok(ws) => {
                info!(call_id = %inner.call_id, "realtime session connected");
                attempt = 0;
                match drive(&inner, ws, &mut audio_rx).await {
                    Outcome::Closed => break,
                    Outcome::ServerEnded => {
                        warn!(call_id = %inner.call_id, "realtime connection ended unexpectedly");
                    }
                }
            }
            Err(e) => {
                warn!(call_id = %inner.call_id, attempt, "realtime connect failed: {e}");
                // An armed termination must not wait on retries.
                if inner.terminate_armed.load(Ordering::SeqCst) {
                    spawn_hook(&inner, HookCall::Terminate(armed_phrase(&inner)));
                }
            }
        }
        attempt += 1;
        if attempt > inner.settings.max_retries {
            error!(call_id = %inner.call_id, "giving up on realtime session after {attempt} attempts");
            if inner.terminate_armed.load(Ordering::SeqCst) {
                spawn_hook(&inner, HookCall::Terminate(armed_phrase(&inner)));
            }
            spawn_hook(
                &inner,
                HookCall::SessionError("realtime session retries exhausted".to_string()),
            );
            break;
        }
        tokio::time::sleep(inner.settings.retry_delay).await;
    }
    inner.closed.store(true, Ordering::SeqCst);
    debug!(call_id = %inner.call_id, "realtime session task finished");
}

async fn connect(inner: &SessionInner) -> BridgeResult<WsStream> {
    let url = format!("{}?model={}", inner.settings.url, inner.settings.model);
    let parsed = url::Url::parse(&url)
        .map_err(|e| BridgeError::Realtime(format!("invalid realtime URL: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| BridgeError::Realtime("realtime URL has no host".into()))?;
    let host_header = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let request = http::Request::builder()
        .uri(&url)
        .header("Authorization", format!("Bearer {}", inner.settings.api_key))
        .header("OpenAI-Beta", "realtime=v1")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", host_header)
        .body(())
        .map_err(|e| BridgeError::Realtime(e.to_string()))?;

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| BridgeError::Realtime(e.to_string()))?;
    Ok(ws)
}

enum Outcome {
    /// Closed on purpose (orchestrator or error event); do not reconnect.
    Closed,
    /// The server side went away; eligible for reconnect.
    ServerEnded,
}

async fn drive(
    inner: &Arc<SessionInner>,
    ws: WsStream,
    audio_rx: &mut mpsc::Receiver<Bytes>,
) -> Outcome {
    let (mut sink, mut stream) = ws.split();

    // Opening handshake: configure the session, start pacing, prompt the
    // assistant to speak first.
    let opening = [
        ClientEvent::SessionUpdate {
            session: build_session_config(&inner.settings),
        },
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(&inner.settings.initial_message),
        },
        ClientEvent::ResponseCreate,
    ];
    inner.sender.start();
    for event in opening {
        if send_event(&mut sink, &event).await.is_err() {
            return Outcome::ServerEnded;
        }
    }

    let mut audio_open = true;
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return Outcome::Closed;
            }

            maybe_audio = audio_rx.recv(), if audio_open => {
                match maybe_audio {
                    Some(bytes) => {
                        if send_event(&mut sink, &ClientEvent::audio_append(&bytes)).await.is_err() {
                            return Outcome::ServerEnded;
                        }
                    }
                    // Receiver closed (teardown under way); keep serving
                    // server events until told to stop.
                    None => audio_open = false,
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if handle_server_event(inner, event).await {
                                    let _ = sink.send(Message::Close(None)).await;
                                    inner.closed.store(true, Ordering::SeqCst);
                                    return Outcome::Closed;
                                }
                            }
                            Err(e) => {
                                warn!(call_id = %inner.call_id, "unparseable server event: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return Outcome::ServerEnded;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(call_id = %inner.call_id, "realtime socket closed by server");
                        return Outcome::ServerEnded;
                    }
                    Some(Err(e)) => {
                        warn!(call_id = %inner.call_id, "realtime socket error: {e}");
                        return Outcome::ServerEnded;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_event(
    sink: &mut (impl futures_util::Sink<Message, Error = tungstenite::Error> + Unpin),
    event: &ClientEvent,
) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize client event: {e}");
            return Err(());
        }
    };
    sink.send(Message::Text(json.into())).await.map_err(|e| {
        warn!("failed to send client event: {e}");
    })
}

fn build_session_config(settings: &SessionSettings) -> SessionConfig {
    SessionConfig {
        modalities: vec!["text".to_string(), "audio".to_string()],
        voice: settings.voice.clone(),
        instructions: settings.instructions.clone(),
        input_audio_format: "g711_ulaw".to_string(),
        output_audio_format: "g711_ulaw".to_string(),
        input_audio_transcription: Some(InputAudioTranscription {
            model: settings.transcription_model.clone(),
            language: Some(settings.transcription_language.clone()),
        }),
        turn_detection: TurnDetection::from(&settings.vad),
    }
}

/// Handle one server event. Returns `true` when the session should close.
async fn handle_server_event(inner: &Arc<SessionInner>, event: ServerEvent) -> bool {
    match event {
        ServerEvent::SessionCreated { session } => {
            info!(call_id = %inner.call_id, session_id = %session.id, "realtime session created");
        }

        ServerEvent::SessionUpdated { session } => {
            debug!(call_id = %inner.call_id, session_id = %session.id, "realtime session updated");
        }

        ServerEvent::ConversationItemCreated { item } => {
            if item.role.as_deref() == Some("user") {
                debug!(call_id = %inner.call_id, "barge-in, flushing playback");
                inner.sender.stop_playback();
                inner.pad_next_delta.store(true, Ordering::SeqCst);
            }
        }

        ServerEvent::AudioDelta { delta } => match ServerEvent::decode_audio_delta(&delta) {
            Ok(audio) => {
                if audio.is_empty() || packet::is_silence(&audio) {
                    trace!(call_id = %inner.call_id, "skipping silent delta");
                } else {
                    inner
                        .total_delta_bytes
                        .fetch_add(audio.len() as u64, Ordering::Relaxed);
                    if inner.pad_next_delta.swap(false, Ordering::SeqCst) {
                        inner
                            .sender
                            .push(&packet::silence(inner.settings.silence_padding_ms));
                    }
                    inner.sender.push(&audio);
                }
            }
            Err(e) => warn!(call_id = %inner.call_id, "undecodable audio delta: {e}"),
        },

        ServerEvent::AudioTranscriptDone { transcript } => {
            inner.transcript.append(Speaker::Assistant, &transcript).await;
            let normalized = normalize_phrase(&transcript);
            if let Some(phrase) = first_match(&inner.settings.terminate_phrases, &normalized) {
                // Arm only. The transcript can land before the response's
                // audio has finished streaming; the terminate hook fires at
                // audio.done so the drain wait covers the whole farewell.
                debug!(call_id = %inner.call_id, phrase, "farewell matched, arming termination");
                *inner.terminate_phrase.lock() = Some(phrase);
                inner.terminate_armed.store(true, Ordering::SeqCst);
            }
            if let Some(phrase) = first_match(&inner.settings.redirect_phrases, &normalized) {
                if inner.terminate_armed.load(Ordering::SeqCst) {
                    info!(call_id = %inner.call_id, phrase, "ignoring redirect, termination armed");
                } else {
                    spawn_hook(inner, HookCall::Redirect(phrase));
                }
            }
        }

        ServerEvent::TranscriptionCompleted { transcript } => {
            inner.transcript.append(Speaker::User, &transcript).await;
        }

        ServerEvent::AudioDone => {
            inner.pad_next_delta.store(true, Ordering::SeqCst);
            if inner.terminate_armed.load(Ordering::SeqCst) {
                spawn_hook(inner, HookCall::Terminate(armed_phrase(inner)));
            }
        }

        ServerEvent::Error { error } => {
            error!(call_id = %inner.call_id, "realtime error: {} - {}", error.error_type, error.message);
            if inner.terminate_armed.load(Ordering::SeqCst) {
                spawn_hook(inner, HookCall::Terminate(armed_phrase(inner)));
            }
            spawn_hook(
                inner,
                HookCall::SessionError(format!("{}: {}", error.error_type, error.message)),
            );
            return true;
        }

        ServerEvent::Other => {
            trace!(call_id = %inner.call_id, "ignoring server event");
        }
    }
    false
}

fn first_match(phrases: &[String], normalized_transcript: &str) -> Option<String> {
    phrases
        .iter()
        .find(|p| normalized_transcript.contains(p.as_str()))
        .cloned()
}

fn armed_phrase(inner: &SessionInner) -> String {
    inner.terminate_phrase.lock().clone().unwrap_or_default()
}

enum HookCall {
    Redirect(String),
    Terminate(String),
    SessionError(String),
}

/// Run a hook on its own task so the orchestrator can close this session
/// from inside the callback without deadlocking the reader.
fn spawn_hook(inner: &Arc<SessionInner>, call: HookCall) {
    let hooks = inner.hooks.clone();
    let call_id = inner.call_id.clone();
    tokio::spawn(async move {
        match call {
            HookCall::Redirect(phrase) => hooks.on_redirect_request(&call_id, &phrase).await,
            HookCall::Terminate(phrase) => hooks.on_terminate_request(&call_id, &phrase).await,
            HookCall::SessionError(message) => hooks.on_session_error(&call_id, &message).await,
        }
    });
}
