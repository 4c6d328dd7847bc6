//! Per-call RTP sender and jitter pacer.
//!
//! Assistant audio arrives from the realtime endpoint in arbitrarily sized
//! chunks and must leave toward the PBX as one 160-byte ulaw packet every
//! 20 ms. `push` splits chunks into packets (a sub-packet tail is buffered
//! until the next push); a pacer task emits packets on a fixed 20 ms grid.
//! Barge-in flushes everything queued; when the queue runs dry the sender
//! fires a drained notification exactly once per drain edge.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::packet::{RtpHeader, SAMPLES_PER_PACKET};
use super::receiver::RtpSource;
use crate::core::error::BridgeResult;

/// Packet cadence: 160 ulaw samples at 8 kHz.
pub const PACKET_INTERVAL: Duration = Duration::from_millis(20);

/// Backpressure bound; beyond this the oldest packets are dropped. 3000
/// packets is a minute of audio, far past anything a response produces.
pub const MAX_QUEUE_PACKETS: usize = 3000;

/// Consecutive send failures before the sender gives up.
const MAX_SEND_ERRORS: u32 = 25;

#[derive(Default)]
struct Queues {
    /// Sub-packet tail waiting for the next push.
    leftover: BytesMut,
    /// Ready 160-byte frames.
    frames: VecDeque<Bytes>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.leftover.is_empty() && self.frames.is_empty()
    }
}

struct SenderInner {
    call_id: String,
    socket: Arc<UdpSocket>,
    dest: RtpSource,
    queues: parking_lot::Mutex<Queues>,
    drained: Notify,
    /// True between a drain edge and the next push.
    idle: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    send_errors: AtomicU32,
    dropped_frames: AtomicU64,
}

/// Paced RTP sender toward the PBX's external-media leg.
///
/// The destination is the shared [`RtpSource`] slot the receiver fills from
/// the first inbound datagram; until it is known, queued frames are held
/// rather than sent blind.
#[derive(Clone)]
pub struct RtpSender {
    inner: Arc<SenderInner>,
}

impl RtpSender {
    /// Create a sender bound to an ephemeral local UDP port.
    pub async fn new(call_id: &str, dest: RtpSource) -> BridgeResult<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(Self {
            inner: Arc::new(SenderInner {
                call_id: call_id.to_string(),
                socket: Arc::new(socket),
                dest,
                queues: parking_lot::Mutex::new(Queues::default()),
                drained: Notify::new(),
                idle: AtomicBool::new(true),
                running: AtomicBool::new(true),
                started: AtomicBool::new(false),
                send_errors: AtomicU32::new(0),
                dropped_frames: AtomicU64::new(0),
            }),
        })
    }

    /// Start the pacer task. Subsequent calls are no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { pace(inner).await });
    }

    /// Queue ulaw audio for playback, splitting into 160-byte frames.
    pub fn push(&self, audio: &[u8]) {
        if audio.is_empty() || !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let mut queues = self.inner.queues.lock();
        queues.leftover.extend_from_slice(audio);
        while queues.leftover.len() >= SAMPLES_PER_PACKET {
            let frame = queues.leftover.split_to(SAMPLES_PER_PACKET).freeze();
            queues.frames.push_back(frame);
        }
        let mut dropped = 0u64;
        while queues.frames.len() > MAX_QUEUE_PACKETS {
            queues.frames.pop_front();
            dropped += 1;
        }
        drop(queues);
        if dropped > 0 {
            let total = self.inner.dropped_frames.fetch_add(dropped, Ordering::Relaxed) + dropped;
            warn!(call_id = %self.inner.call_id, dropped, total, "playback queue overflow");
        }
        self.inner.idle.store(false, Ordering::SeqCst);
    }

    /// Barge-in: drop everything queued. The next playback starts from the
    /// next push.
    pub fn stop_playback(&self) {
        let mut queues = self.inner.queues.lock();
        let flushed = queues.frames.len();
        queues.leftover.clear();
        queues.frames.clear();
        drop(queues);
        if flushed > 0 {
            debug!(call_id = %self.inner.call_id, flushed, "playback flushed");
        }
    }

    /// True when nothing is queued and the drain edge has fired.
    pub fn is_idle(&self) -> bool {
        self.inner.idle.load(Ordering::SeqCst) && self.inner.queues.lock().is_empty()
    }

    /// Wait until the pacer reports the queue drained. Returns immediately
    /// when already idle.
    pub async fn wait_drained(&self) {
        let notified = self.inner.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_idle() {
            return;
        }
        notified.await;
    }

    /// Stop the pacer; queued audio is discarded. The socket is released when
    /// the last handle drops.
    pub fn end(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            debug!(call_id = %self.inner.call_id, "RTP sender ended");
        }
    }

    pub fn is_ended(&self) -> bool {
        !self.inner.running.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> usize {
        self.inner.queues.lock().frames.len()
    }
}

/// Pacer loop: one frame per 20 ms tick.
///
/// `tokio::time::interval` schedules ticks against the start instant, so a
/// late tick does not push the whole grid back the way a naive
/// sleep-20ms-after-send would.
async fn pace(inner: Arc<SenderInner>) {
    let mut header = RtpHeader {
        sequence: rand::random(),
        timestamp: rand::random(),
        ssrc: rand::random(),
    };
    let mut interval = tokio::time::interval(PACKET_INTERVAL);

    loop {
        interval.tick().await;
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        let Some(dest) = *inner.dest.lock() else {
            // Peer address not learned yet; hold the queue.
            continue;
        };

        let (frame, empty_after) = {
            let mut queues = inner.queues.lock();
            match queues.frames.pop_front() {
                Some(frame) => {
                    let empty = queues.is_empty();
                    (Some(frame), empty)
                }
                None => (None, queues.is_empty()),
            }
        };

        match frame {
            Some(frame) => {
                let datagram = header.encode(&frame);
                header.sequence = header.sequence.wrapping_add(1);
                header.timestamp = header.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
                match inner.socket.send_to(&datagram, dest).await {
                    Ok(_) => {
                        inner.send_errors.store(0, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let errors = inner.send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(call_id = %inner.call_id, errors, "RTP send failed: {e}");
                        if errors >= MAX_SEND_ERRORS {
                            warn!(call_id = %inner.call_id, "too many RTP send failures, closing sender");
                            inner.running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                if empty_after && !inner.idle.swap(true, Ordering::SeqCst) {
                    trace!(call_id = %inner.call_id, "playback drained");
                    inner.drained.notify_waiters();
                }
            }
            None => {
                // Queue ran out between ticks (barge-in flush); report the
                // drain edge once.
                if empty_after && !inner.idle.swap(true, Ordering::SeqCst) {
                    trace!(call_id = %inner.call_id, "playback drained");
                    inner.drained.notify_waiters();
                }
            }
        }
    }
    debug!(call_id = %inner.call_id, "RTP pacer stopped");
}
