//! Per-call state.
//!
//! A call is keyed by the PBX channel id of its SIP leg. The handle bundles
//! the media endpoints (shared freely with the session and orchestrator
//! tasks) with a mutex-guarded record of the lifecycle fields; every
//! lifecycle mutation happens under that single lock.

use std::fmt;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::realtime::RealtimeSession;
use super::rtp::receiver::RtpSource;
use super::rtp::{RtpReceiver, RtpSender};
use super::transcript::TranscriptHandle;

/// Why a call was (or is being) torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReason {
    BothEnded,
    GraceTimeout,
    BridgeDestroyed,
    DurationLimit,
    Shutdown,
    SetupError,
    AssistantTerminate(String),
    RedirectCleanup,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReason::BothEnded => write!(f, "both-ended"),
            CleanupReason::GraceTimeout => write!(f, "grace-timeout"),
            CleanupReason::BridgeDestroyed => write!(f, "bridge-destroyed"),
            CleanupReason::DurationLimit => write!(f, "duration-limit"),
            CleanupReason::Shutdown => write!(f, "shutdown"),
            CleanupReason::SetupError => write!(f, "stasisstart-error"),
            CleanupReason::AssistantTerminate(phrase) => {
                write!(f, "assistant-terminate:{phrase}")
            }
            CleanupReason::RedirectCleanup => write!(f, "redirect-cleanup"),
        }
    }
}

/// Mutable lifecycle record of one call.
#[derive(Default)]
pub struct CallState {
    pub bridge_id: String,
    pub external_leg_id: Option<String>,
    pub session: Option<RealtimeSession>,
    /// One-shot CALL_DURATION_LIMIT hangup timer.
    pub duration_timer: Option<JoinHandle<()>>,
    /// Debounce between the first leg ending and forced cleanup.
    pub grace_timer: Option<JoinHandle<()>>,
    pub sip_ended: bool,
    pub ext_ended: bool,
    /// Queue handoff in progress; locks out terminate and the SIP hangup.
    pub redirecting: bool,
    /// Farewell matched; cleanup waits for playback to drain.
    pub terminate_after_playback: bool,
    /// The phrase that armed termination, kept for the cleanup reason.
    pub terminate_phrase: Option<String>,
    /// The terminate finalize task has been spawned.
    pub finalize_started: bool,
    pub cleaned: bool,
}

/// Handle to one live call.
pub struct CallHandle {
    /// PBX channel id of the SIP leg; doubles as the call id.
    pub id: String,
    pub caller_identity: String,
    pub rtp_port: u16,
    /// PBX-side RTP address, learned from the first inbound datagram.
    pub rtp_source: RtpSource,
    pub sender: RtpSender,
    pub receiver: RtpReceiver,
    pub transcript: TranscriptHandle,
    pub state: Mutex<CallState>,
}

impl CallHandle {
    pub fn new(
        id: &str,
        caller_identity: String,
        bridge_id: String,
        rtp_port: u16,
        rtp_source: RtpSource,
        sender: RtpSender,
        receiver: RtpReceiver,
        transcript: TranscriptHandle,
    ) -> Self {
        Self {
            id: id.to_string(),
            caller_identity,
            rtp_port,
            rtp_source,
            sender,
            receiver,
            transcript,
            state: Mutex::new(CallState {
                bridge_id,
                ..CallState::default()
            }),
        }
    }
}
