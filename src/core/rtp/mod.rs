//! Per-call RTP media path.
//!
//! The PBX originates an external-media leg that speaks plain RTP/ulaw over
//! UDP on 127.0.0.1. Each call owns one receiver (caller audio in) and one
//! sender (assistant audio out, paced at 20 ms).
//!
//! - `packet` - RFC 3550 fixed-header encode/decode and ulaw helpers
//! - `receiver` - UDP listener feeding the realtime session's audio sink
//! - `sender` - jitter-safe pacer with barge-in flush and drain signalling

pub mod packet;
pub mod receiver;
pub mod sender;

pub use packet::{PAYLOAD_TYPE_PCMU, RTP_HEADER_LEN, SAMPLES_PER_PACKET, ULAW_SILENCE};
pub use receiver::RtpReceiver;
pub use sender::RtpSender;
