//! PBX orchestrator: the per-call lifecycle state machine.
//!
//! Consumes the ARI event stream and coordinates the four per-call event
//! sources (PBX control events, realtime WebSocket, inbound RTP, outbound
//! pacing) into one idempotent teardown. All lifecycle mutations happen
//! under the call's state lock; cleanup is serialized through the
//! registry's at-most-once cell, so a second cleanup request joins the
//! first instead of racing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::ari::events::Channel;
use super::ari::{AriEvent, ChannelControl};
use super::call::{CallHandle, CleanupReason};
use super::error::BridgeResult;
use super::mailer::TranscriptMailer;
use super::ports::RtpPortPool;
use super::realtime::{RealtimeSession, SessionEvents, SessionSettings};
use super::registry::CallRegistry;
use super::rtp::receiver::RtpSource;
use super::rtp::{RtpReceiver, RtpSender};
use super::transcript::TranscriptWriter;
use crate::config::BridgeConfig;

/// Capacity of the caller-audio channel between receiver and session;
/// 256 packets is roughly five seconds of ulaw.
const CALLER_AUDIO_CAPACITY: usize = 256;

/// Dialplan priority used when continuing a handed-off SIP leg.
const DIALPLAN_PRIORITY: i32 = 1;

/// Fallback dialplan contexts tried after `REDIRECTION_QUEUE_CONTEXT`.
const FALLBACK_CONTEXTS: [&str; 2] = ["ext-queues", "from-internal"];

/// Process-wide bridge core: registry, port pool and the per-call state
/// machine, driven by ARI events.
pub struct Orchestrator {
    config: Arc<BridgeConfig>,
    control: Arc<dyn ChannelControl>,
    registry: Arc<CallRegistry>,
    ports: Arc<RtpPortPool>,
    transcripts: TranscriptWriter,
    mailer: Option<Arc<TranscriptMailer>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: Arc<BridgeConfig>,
        control: Arc<dyn ChannelControl>,
        mailer: Option<TranscriptMailer>,
    ) -> Self {
        let ports = Arc::new(RtpPortPool::new(
            config.rtp_port_start,
            config.max_concurrent_calls,
        ));
        let transcripts = TranscriptWriter::new(config.recordings_dir.clone());
        Self {
            config,
            control,
            registry: Arc::new(CallRegistry::new()),
            ports,
            transcripts,
            mailer: mailer.map(Arc::new),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<RtpPortPool> {
        &self.ports
    }

    /// Drain the ARI event channel until it closes.
    pub async fn run(self: &Arc<Self>, mut events: mpsc::Receiver<AriEvent>) {
        while let Some(event) = events.recv().await {
            let orchestrator = self.clone();
            // Events are independent per call; a slow setup must not delay
            // another call's teardown.
            tokio::spawn(async move { orchestrator.handle_event(event).await });
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: AriEvent) {
        match event {
            AriEvent::StasisStart { channel, .. } => {
                if channel.is_local() {
                    debug!(channel = %channel.name, "ignoring Local pseudo-leg");
                } else if channel.is_external_media() {
                    self.on_external_media_enter(channel).await;
                } else {
                    self.on_call_start(channel).await;
                }
            }
            AriEvent::StasisEnd { channel } | AriEvent::ChannelDestroyed { channel } => {
                self.on_leg_end(&channel.id).await;
            }
            AriEvent::BridgeDestroyed { bridge } => {
                self.on_bridge_destroyed(&bridge.id).await;
            }
            AriEvent::Other => {}
        }
    }

    // -------------------------------------------------------------------------
    // Call setup
    // -------------------------------------------------------------------------

    async fn on_call_start(self: &Arc<Self>, channel: Channel) {
        let call_id = channel.id.clone();
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(call_id, "rejecting call during shutdown");
            let _ = self.control.hangup(&call_id).await;
            return;
        }
        info!(call_id, caller = %channel.caller_identity(), channel = %channel.name, "incoming call");
        if let Err(e) = self.setup_call(&channel).await {
            error!(call_id, "call setup failed: {e}");
            self.cleanup(&call_id, CleanupReason::SetupError).await;
        }
    }

    async fn setup_call(self: &Arc<Self>, channel: &Channel) -> BridgeResult<()> {
        let bridge_id = self.control.create_bridge().await?;
        let result = self.setup_call_in_bridge(channel, &bridge_id).await;
        if result.is_err() && !self.registry.contains(&channel.id) {
            // Failed before the call was registered; nothing else will
            // reclaim the bridge.
            let _ = self.control.destroy_bridge(&bridge_id).await;
        }
        result
    }

    async fn setup_call_in_bridge(
        self: &Arc<Self>,
        channel: &Channel,
        bridge_id: &str,
    ) -> BridgeResult<()> {
        let call_id = &channel.id;
        self.control.add_channel(bridge_id, call_id).await?;
        self.control.answer(call_id).await?;

        let port = self.ports.acquire()?;
        let receiver = match RtpReceiver::bind(call_id, port).await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };
        let rtp_source: RtpSource = Arc::new(parking_lot::Mutex::new(None));
        let sender = match RtpSender::new(call_id, rtp_source.clone()).await {
            Ok(sender) => sender,
            Err(e) => {
                receiver.close().await;
                self.ports.release(port);
                return Err(e);
            }
        };

        let caller_identity = channel.caller_identity();
        let transcript = self.transcripts.open(&caller_identity, call_id);
        let handle = Arc::new(CallHandle::new(
            call_id,
            caller_identity,
            bridge_id.to_string(),
            port,
            rtp_source.clone(),
            sender.clone(),
            receiver.clone(),
            transcript.clone(),
        ));
        self.registry.insert(handle.clone());

        // Start listening before the PBX can start sending.
        let (audio_tx, audio_rx) = mpsc::channel(CALLER_AUDIO_CAPACITY);
        receiver.spawn(rtp_source, audio_tx);

        let external_leg = self
            .control
            .external_media(&format!("127.0.0.1:{port}"))
            .await?;
        self.registry.map_external(&external_leg, call_id);
        debug!(call_id, external_leg, port, "external media leg originated");

        let hooks: Arc<dyn SessionEvents> = Arc::new(self.clone());
        let session = RealtimeSession::new(
            call_id,
            SessionSettings::from_config(&self.config),
            sender,
            transcript,
            hooks,
            self.registry.clone(),
        );
        session.spawn(audio_rx);

        {
            let mut state = handle.state.lock().await;
            state.external_leg_id = Some(external_leg);
            state.session = Some(session);
            if let Some(limit) = self.config.call_duration_limit {
                let control = self.control.clone();
                let id = call_id.clone();
                state.duration_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    warn!(call_id = %id, "call duration limit reached, hanging up");
                    let _ = control.hangup(&id).await;
                }));
            }
        }
        info!(call_id, port, "call wired into bridge");
        Ok(())
    }

    /// The external-media leg entered the application; put it in the call's
    /// bridge. Its StasisStart can overtake the originate response, hence
    /// the bounded mapping wait.
    async fn on_external_media_enter(&self, channel: Channel) {
        if self.registry.is_external_ignored(&channel.id) {
            info!(external_leg = %channel.id, "ignoring external leg marked for teardown");
            return;
        }
        let Some(call_id) = self.registry.wait_external_mapping(&channel.id).await else {
            error!(external_leg = %channel.id, "external media leg has no owning call");
            return;
        };
        let Some(handle) = self.registry.get(&call_id) else {
            info!(external_leg = %channel.id, call_id, "owning call already gone");
            return;
        };
        let bridge_id = handle.state.lock().await.bridge_id.clone();
        match self.control.add_channel(&bridge_id, &channel.id).await {
            Ok(()) => debug!(call_id, external_leg = %channel.id, "external leg bridged"),
            // Cleanup garbage-collects the leg on its StasisEnd.
            Err(e) => error!(call_id, external_leg = %channel.id, "failed to bridge external leg: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // Teardown triggers
    // -------------------------------------------------------------------------

    async fn on_leg_end(self: &Arc<Self>, channel_id: &str) {
        if self.registry.is_cleaned(channel_id) {
            info!(channel_id, "late event for cleaned call");
            return;
        }
        let (call_id, is_external) = if self.registry.contains(channel_id) {
            (channel_id.to_string(), false)
        } else if let Some(call_id) = self.registry.resolve_external(channel_id) {
            (call_id, true)
        } else if self.registry.is_external_ignored(channel_id) {
            info!(channel_id, "late event for ignored external leg");
            return;
        } else {
            info!(channel_id, "leg-end for unknown channel");
            return;
        };
        if self.registry.is_cleaned(&call_id) {
            info!(call_id, "late leg-end for cleaned call");
            return;
        }
        let Some(handle) = self.registry.get(&call_id) else {
            info!(call_id, "leg-end raced call removal");
            return;
        };

        let both_ended = {
            let mut state = handle.state.lock().await;
            if is_external {
                state.ext_ended = true;
            } else {
                state.sip_ended = true;
            }
            state.sip_ended && state.ext_ended
        };
        debug!(call_id, is_external, both_ended, "leg ended");

        if both_ended {
            self.cleanup(&call_id, CleanupReason::BothEnded).await;
        } else {
            let orchestrator = self.clone();
            let id = call_id.clone();
            let grace = self.config.cleanup_grace;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                orchestrator.cleanup(&id, CleanupReason::GraceTimeout).await;
            });
            let mut state = handle.state.lock().await;
            if let Some(previous) = state.grace_timer.replace(timer) {
                previous.abort();
            }
        }
    }

    async fn on_bridge_destroyed(self: &Arc<Self>, bridge_id: &str) {
        match self.registry.find_by_bridge(bridge_id).await {
            Some(handle) => {
                let call_id = handle.id.clone();
                warn!(call_id, bridge_id, "bridge destroyed externally");
                self.cleanup(&call_id, CleanupReason::BridgeDestroyed).await;
            }
            None => info!(bridge_id, "bridge-destroyed for unknown bridge"),
        }
    }

    // -------------------------------------------------------------------------
    // Queue handoff
    // -------------------------------------------------------------------------

    /// Tear down the media path and continue the live SIP leg into the
    /// dialplan queue. Each step is best-effort; the later leg-end cleanup
    /// must neither hang up the SIP leg nor send email (gated on
    /// `redirecting`).
    pub async fn redirect_to_queue(&self, call_id: &str, phrase: &str) {
        let Some(queue) = self.config.redirection_queue.clone() else {
            warn!(call_id, "redirect requested but REDIRECTION_QUEUE is not configured");
            return;
        };
        let Some(handle) = self.registry.get(call_id) else {
            debug!(call_id, "redirect callback for unregistered call");
            return;
        };
        let (external_leg, bridge_id, session) = {
            let mut state = handle.state.lock().await;
            if state.redirecting || state.cleaned {
                return;
            }
            if state.terminate_after_playback {
                info!(call_id, "redirect ignored, termination already armed");
                return;
            }
            state.redirecting = true;
            (
                state.external_leg_id.clone(),
                state.bridge_id.clone(),
                state.session.clone(),
            )
        };
        info!(call_id, phrase, queue, "handing call off to queue");

        handle.sender.end();
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(external_leg) = &external_leg {
            self.registry.ignore_external_leg(external_leg);
            if let Err(e) = self.control.hangup(external_leg).await {
                warn!(call_id, "external leg hangup failed: {e}");
            }
        }
        if let Err(e) = self.control.destroy_bridge(&bridge_id).await {
            warn!(call_id, "bridge destroy failed: {e}");
        }
        handle.receiver.close().await;
        self.ports.release(handle.rtp_port);

        let mut contexts: Vec<&str> = Vec::new();
        if let Some(context) = self.config.redirection_queue_context.as_deref() {
            contexts.push(context);
        }
        contexts.extend(FALLBACK_CONTEXTS);

        let mut continued = false;
        for context in contexts {
            match self
                .control
                .continue_in_dialplan(call_id, context, &queue, DIALPLAN_PRIORITY)
                .await
            {
                Ok(()) => {
                    info!(call_id, context, extension = %queue, "SIP leg continued into dialplan");
                    continued = true;
                    break;
                }
                Err(e) => warn!(call_id, context, "continue failed: {e}"),
            }
        }
        if !continued {
            error!(call_id, "all dialplan contexts failed, hanging up as last resort");
            let _ = self.control.hangup(call_id).await;
        }
    }

    // -------------------------------------------------------------------------
    // Graceful termination
    // -------------------------------------------------------------------------

    /// Wait for playback to drain (bounded by `TERMINATE_FALLBACK_MS`), then
    /// clean up. Runs at most once per call via `finalize_started`.
    async fn finalize_termination(self: &Arc<Self>, handle: Arc<CallHandle>, phrase: String) {
        let call_id = handle.id.clone();

        // Watchdog: if the finalize stalls, force the (idempotent) cleanup.
        let watchdog = {
            let orchestrator = self.clone();
            let id = call_id.clone();
            let phrase = phrase.clone();
            let after = self.config.termination_watchdog;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if orchestrator.registry.contains(&id) {
                    warn!(call_id = %id, "termination watchdog fired");
                    orchestrator
                        .cleanup(&id, CleanupReason::AssistantTerminate(phrase))
                        .await;
                }
            })
        };

        if !handle.sender.is_idle() {
            let received_audio_ms = {
                let state = handle.state.lock().await;
                state
                    .session
                    .as_ref()
                    .map(|s| s.total_delta_bytes() / 8)
                    .unwrap_or_default()
            };
            debug!(call_id, received_audio_ms, "waiting for farewell playback to drain");
            tokio::select! {
                _ = handle.sender.wait_drained() => debug!(call_id, "farewell playback drained"),
                _ = tokio::time::sleep(self.config.terminate_fallback) => {
                    warn!(call_id, "drain fallback elapsed, terminating anyway");
                }
            }
        }
        self.cleanup(&call_id, CleanupReason::AssistantTerminate(phrase))
            .await;
        watchdog.abort();
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    /// Idempotent teardown. Concurrent and repeated requests for the same
    /// call join the first run.
    pub async fn cleanup(self: &Arc<Self>, call_id: &str, reason: CleanupReason) {
        if self.registry.is_cleaned(call_id) {
            return;
        }
        let cell = self.registry.cleanup_cell(call_id);
        let orchestrator = self.clone();
        let id = call_id.to_string();
        cell.get_or_init(|| async move { orchestrator.run_cleanup(&id, reason).await })
            .await;
        self.registry.drop_cleanup_cell(call_id);
    }

    async fn run_cleanup(self: &Arc<Self>, call_id: &str, reason: CleanupReason) {
        info!(call_id, %reason, "cleaning up call");
        let Some(handle) = self.registry.get(call_id) else {
            // Setup failed before registration: nothing to release beyond a
            // last-resort hangup of the SIP leg.
            let _ = self.control.hangup(call_id).await;
            self.registry.remove_and_mark_cleaned(call_id);
            return;
        };

        let (external_leg, bridge_id, redirecting, session) = {
            let mut state = handle.state.lock().await;
            if state.cleaned {
                return;
            }
            state.cleaned = true;
            if let Some(timer) = state.duration_timer.take() {
                timer.abort();
            }
            if let Some(timer) = state.grace_timer.take() {
                timer.abort();
            }
            (
                state.external_leg_id.take(),
                std::mem::take(&mut state.bridge_id),
                state.redirecting,
                state.session.take(),
            )
        };
        if let Some(external_leg) = &external_leg {
            self.registry.ignore_external_leg(external_leg);
        }

        handle.sender.end();
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(external_leg) = &external_leg {
            if let Err(e) = self.control.hangup(external_leg).await {
                debug!(call_id, "external leg hangup failed: {e}");
            }
        }
        if !bridge_id.is_empty() {
            if let Err(e) = self.control.destroy_bridge(&bridge_id).await {
                debug!(call_id, "bridge destroy failed: {e}");
            }
        }
        if redirecting {
            debug!(call_id, "leaving SIP leg alive after handoff");
        } else if let Err(e) = self.control.hangup(call_id).await {
            debug!(call_id, "SIP leg hangup failed: {e}");
        }

        handle.receiver.close().await;
        self.ports.release(handle.rtp_port);
        if let Some(external_leg) = &external_leg {
            self.registry.unmap_external(external_leg);
        }

        if let Some(mailer) = &self.mailer {
            if redirecting {
                debug!(call_id, "suppressing transcript email after handoff");
            } else {
                let mailer = mailer.clone();
                let id = call_id.to_string();
                let caller = handle.caller_identity.clone();
                let path = handle.transcript.path().to_path_buf();
                let reason = reason.to_string();
                tokio::spawn(async move {
                    mailer.send_transcript(&id, &caller, &path, &reason).await;
                });
            }
        }

        self.registry.remove_and_mark_cleaned(call_id);
        info!(call_id, %reason, "call cleaned up");
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Clean up every live call in parallel (SIGINT/SIGTERM path).
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let call_ids = self.registry.call_ids();
        if call_ids.is_empty() {
            return;
        }
        info!(calls = call_ids.len(), "shutting down, cleaning all calls");
        join_all(
            call_ids
                .iter()
                .map(|id| self.cleanup(id, CleanupReason::Shutdown)),
        )
        .await;
    }
}

/// Session callbacks. Every method re-validates against the registry so a
/// stale callback (late event, wrong call id) is dropped instead of acting
/// on another call's state.
#[async_trait]
impl SessionEvents for Arc<Orchestrator> {
    async fn on_redirect_request(&self, call_id: &str, phrase: &str) {
        self.redirect_to_queue(call_id, phrase).await;
    }

    async fn on_terminate_request(&self, call_id: &str, phrase: &str) {
        let Some(handle) = self.registry.get(call_id) else {
            debug!(call_id, "terminate callback for unregistered call");
            return;
        };
        {
            let mut state = handle.state.lock().await;
            if state.redirecting || state.cleaned {
                info!(call_id, "terminate skipped, handoff or cleanup in progress");
                return;
            }
            state.terminate_after_playback = true;
            state.terminate_phrase = Some(phrase.to_string());
            if state.finalize_started {
                return;
            }
            state.finalize_started = true;
        }
        info!(call_id, phrase, "farewell matched, terminating after playback");
        self.finalize_termination(handle, phrase.to_string()).await;
    }

    async fn on_session_error(&self, call_id: &str, message: &str) {
        // An armed termination reaches us through on_terminate_request even
        // on error paths; nothing to do here beyond the record.
        warn!(call_id, "session error: {message}");
    }
}
