//! Bridge core: call lifecycle, media path and external protocol clients.
//!
//! - `ari` - PBX control (event stream + REST operations)
//! - `call` - per-call state and cleanup reasons
//! - `error` - error types
//! - `mailer` - post-call transcript email
//! - `orchestrator` - the per-call lifecycle state machine
//! - `ports` - RTP port pool
//! - `realtime` - conversational endpoint client
//! - `registry` - process-wide call registry
//! - `rtp` - RTP receive/send media path
//! - `transcript` - append-only transcript files

pub mod ari;
pub mod call;
pub mod error;
pub mod mailer;
pub mod orchestrator;
pub mod ports;
pub mod realtime;
pub mod registry;
pub mod rtp;
pub mod transcript;

pub use ari::{AriClient, AriEvent, ChannelControl};
pub use call::{CallHandle, CleanupReason};
pub use error::{BridgeError, BridgeResult};
pub use mailer::TranscriptMailer;
pub use orchestrator::Orchestrator;
pub use ports::RtpPortPool;
pub use registry::CallRegistry;
