//! RTP packet building and parsing.
//!
//! Implements the RFC 3550 fixed header for the one profile the bridge
//! speaks: payload type 0 (PCMU), 8 kHz, 160 samples per 20 ms packet.

use bytes::{BufMut, Bytes, BytesMut};

/// Fixed RTP header length; CSRC lists and extensions are not produced and
/// are ignored on receive.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP version 2.
pub const RTP_VERSION: u8 = 2;

/// Static payload type 0: PCMU (G.711 ulaw).
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

/// Samples (= ulaw bytes) per packet at 8 kHz / 20 ms.
pub const SAMPLES_PER_PACKET: usize = 160;

/// Ulaw digital silence fill byte.
pub const ULAW_SILENCE: u8 = 0x7F;

/// Outbound RTP header state for one sender.
#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Serialize the header followed by `payload`.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        // V(2) P(1) X(1) CC(4)
        buf.put_u8(RTP_VERSION << 6);
        // M(1) PT(7)
        buf.put_u8(PAYLOAD_TYPE_PCMU);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Strip the RTP header from an inbound datagram.
///
/// Returns the payload slice, or `None` for datagrams shorter than the fixed
/// header (dropped silently by the receiver).
pub fn payload_of(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < RTP_HEADER_LEN {
        return None;
    }
    Some(&datagram[RTP_HEADER_LEN..])
}

/// A run of ulaw silence covering `ms` milliseconds (8 bytes per ms).
pub fn silence(ms: u64) -> Bytes {
    Bytes::from(vec![ULAW_SILENCE; (ms * 8) as usize])
}

/// True when a decoded audio chunk is nothing but ulaw silence.
pub fn is_silence(audio: &[u8]) -> bool {
    audio.iter().all(|b| *b == ULAW_SILENCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fixed_header() {
        let header = RtpHeader {
            sequence: 0x0102,
            timestamp: 0x0A0B0C0D,
            ssrc: 0xDEADBEEF,
        };
        let packet = header.encode(&[0x7F; SAMPLES_PER_PACKET]);
        assert_eq!(packet.len(), RTP_HEADER_LEN + SAMPLES_PER_PACKET);
        assert_eq!(packet[0], 0x80); // version 2, no padding/extension/CSRC
        assert_eq!(packet[1], PAYLOAD_TYPE_PCMU);
        assert_eq!(&packet[2..4], &[0x01, 0x02]);
        assert_eq!(&packet[4..8], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&packet[8..12], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn strips_header_and_drops_runts() {
        let header = RtpHeader {
            sequence: 1,
            timestamp: 160,
            ssrc: 7,
        };
        let packet = header.encode(b"abc");
        assert_eq!(payload_of(&packet), Some(&b"abc"[..]));
        assert_eq!(payload_of(&packet[..11]), None);
        assert_eq!(payload_of(&packet[..12]), Some(&[][..]));
    }

    #[test]
    fn silence_helpers_agree() {
        let pad = silence(100);
        assert_eq!(pad.len(), 800);
        assert!(is_silence(&pad));
        assert!(!is_silence(&[0x7F, 0x00]));
    }
}
