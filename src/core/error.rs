//! Error types for the bridge core.

use thiserror::Error;

/// Errors surfaced by the bridge core.
///
/// Per-call failures are fatal for the affected call only; the orchestrator
/// reacts by running that call's cleanup. Nothing here is allowed to escape
/// a teardown path.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// PBX control (ARI) request or event-stream failure
    #[error("PBX control error: {0}")]
    Control(String),

    /// Realtime endpoint failure
    #[error("realtime error: {0}")]
    Realtime(String),

    /// RTP port range saturated or concurrent-call cap reached
    #[error("RTP port range exhausted")]
    ResourceExhausted,

    /// Socket or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event referenced a call that is not (or no longer) registered
    #[error("call {0} is not registered")]
    UnknownCall(String),

    /// Startup configuration problem
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
