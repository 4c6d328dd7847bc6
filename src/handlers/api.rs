//! Health check endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

/// Shared state for the health probe.
pub struct HealthState {
    started_at: Instant,
    started: String,
    pbx_connected: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new(pbx_connected: Arc<AtomicBool>) -> Self {
        Self {
            started_at: Instant::now(),
            started: chrono::Utc::now().to_rfc3339(),
            pbx_connected,
        }
    }
}

/// GET `/health` (also `/` and `/ready`).
pub async fn health_check(State(state): State<Arc<HealthState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.started_at.elapsed().as_secs(),
        "rss_mb": rss_mb(),
        "pbx_connected": state.pbx_connected.load(Ordering::SeqCst),
        "pid": std::process::id(),
        "started": state.started,
    }))
}

/// Resident set size in MiB, read from /proc on Linux.
fn rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}
