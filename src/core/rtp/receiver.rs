//! Per-call RTP receiver.
//!
//! Listens on the call's allocated UDP port, strips the RTP header and
//! forwards ulaw payloads into the realtime session's caller-audio sink.
//! The first datagram also teaches the sender where the PBX's external-media
//! leg is listening.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::packet;
use crate::core::error::BridgeResult;

/// Shared slot holding the PBX-side RTP address, learned from the first
/// inbound datagram and read by the sender.
pub type RtpSource = Arc<Mutex<Option<SocketAddr>>>;

/// How long `close` waits for the receive loop to let go of the socket. The
/// port must not be reusable before the socket is actually closed.
const CLOSE_SETTLE: Duration = Duration::from_millis(250);

/// Per-call UDP listener for caller audio.
///
/// The receive task owns the socket; `close` stops the task and waits for
/// the socket to be dropped, so the port is free for the pool again when it
/// returns. `close` is idempotent, and datagrams arriving after it are
/// dropped without error. Socket failures demote the receiver to closed and
/// never take the process down.
#[derive(Clone)]
pub struct RtpReceiver {
    inner: Arc<ReceiverInner>,
}

struct ReceiverInner {
    call_id: String,
    port: u16,
    /// Held here between bind and spawn, then moved into the task.
    socket: Mutex<Option<UdpSocket>>,
    closed: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    packets_in: AtomicU64,
}

impl RtpReceiver {
    /// Bind to `127.0.0.1:port`.
    pub async fn bind(call_id: &str, port: u16) -> BridgeResult<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", port)).await?;
        let port = socket.local_addr()?.port();
        Ok(Self {
            inner: Arc::new(ReceiverInner {
                call_id: call_id.to_string(),
                port,
                socket: Mutex::new(Some(socket)),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                task: Mutex::new(None),
                packets_in: AtomicU64::new(0),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Spawn the receive loop. Payload bytes go to `sink`; the first
    /// datagram's origin is stored into `source`.
    pub fn spawn(&self, source: RtpSource, sink: mpsc::Sender<Bytes>) {
        let Some(socket) = self.inner.socket.lock().take() else {
            return;
        };
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                tokio::select! {
                    _ = inner.shutdown.notified() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(call_id = %inner.call_id, "RTP receive failed, closing listener: {e}");
                                inner.closed.store(true, Ordering::SeqCst);
                                break;
                            }
                        };
                        if inner.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        if inner.packets_in.fetch_add(1, Ordering::Relaxed) == 0 {
                            debug!(call_id = %inner.call_id, %from, "learned RTP peer address");
                            *source.lock() = Some(from);
                        }
                        let Some(payload) = packet::payload_of(&buf[..len]) else {
                            trace!(call_id = %inner.call_id, len, "dropping short datagram");
                            continue;
                        };
                        if payload.is_empty() {
                            continue;
                        }
                        // Audio is disposable; drop the chunk rather than stall
                        // the socket when the session falls behind.
                        if sink.try_send(Bytes::copy_from_slice(payload)).is_err() {
                            trace!(call_id = %inner.call_id, "caller-audio sink full, dropping payload");
                        }
                    }
                }
            }
            drop(socket);
            debug!(call_id = %inner.call_id, port = inner.port,
                   packets = inner.packets_in.load(Ordering::Relaxed), "RTP receiver stopped");
        });
        *self.inner.task.lock() = Some(task);
    }

    /// Stop the receive loop and wait for the socket to be released.
    /// Idempotent; returns once the port is safe to hand back to the pool.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        // Covers the bound-but-never-spawned case.
        drop(self.inner.socket.lock().take());
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
}
