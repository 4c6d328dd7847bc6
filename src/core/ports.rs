//! RTP port pool.
//!
//! One UDP port per active call, handed out from a fixed range. The pool is
//! the only resource contended across calls, so it sits behind a plain mutex
//! with short critical sections.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use super::error::{BridgeError, BridgeResult};

/// Fixed-range UDP port allocator.
///
/// Ports are handed out lowest-free-first so recently released ports stay
/// hot. `release` of a port outside the range (or one that is already free)
/// is a silent no-op; cleanup releases defensively.
pub struct RtpPortPool {
    start: u16,
    end: u16,
    free: Mutex<BTreeSet<u16>>,
}

impl RtpPortPool {
    /// Create a pool covering `start .. start + capacity`.
    pub fn new(start: u16, capacity: usize) -> Self {
        let end = start.saturating_add(capacity as u16);
        Self {
            start,
            end,
            free: Mutex::new((start..end).collect()),
        }
    }

    /// Take the lowest free port.
    pub fn acquire(&self) -> BridgeResult<u16> {
        let mut free = self.free.lock();
        let port = free.iter().next().copied().ok_or(BridgeError::ResourceExhausted)?;
        free.remove(&port);
        Ok(port)
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        if port < self.start || port >= self.end {
            return;
        }
        self.free.lock().insert(port);
    }

    /// Number of ports currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
