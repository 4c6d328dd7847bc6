//! Asterisk REST Interface (ARI) client.
//!
//! The bridge registers as a Stasis application: call-control events arrive
//! over the `/ari/events` WebSocket, and channel/bridge operations go out
//! over the REST surface. Only the subset the bridge consumes is modelled;
//! duplicate event delivery is tolerated by the orchestrator.
//!
//! - `events` - the event-stream payloads (StasisStart, StasisEnd, ...)
//! - `client` - REST operations behind the [`ChannelControl`] seam

pub mod client;
pub mod events;

pub use client::{AriClient, ChannelControl};
pub use events::{AriEvent, Bridge, Channel};
