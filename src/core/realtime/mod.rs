//! Realtime conversational endpoint client.
//!
//! One WebSocket session per call: caller ulaw goes up as base64 audio
//! buffer appends, assistant audio deltas come back down and feed the RTP
//! sender, and transcripts of both sides drive the transcript sink and the
//! phrase-triggered handoff/terminate hooks.
//!
//! - `messages` - the wire event subset the bridge consumes
//! - `session` - per-call WebSocket client and event handling

pub mod messages;
pub mod session;

pub use messages::{ClientEvent, ServerEvent, SessionConfig, TurnDetection};
pub use session::{RealtimeSession, SessionEvents, SessionSettings};
