//! Error taxonomy shared by every registry and state machine in the core.
//!
//! Mirrors the error kinds the daemon distinguishes: lookups that found
//! nothing (or a concurrently-tearing-down entity), double-set protocol
//! bugs, wire-framing violations, and resource exhaustion. Transient flush
//! skips are *not* part of this enum — they are a positive `FlushOutcome`
//! value, never an error (see `index::FlushOutcome`).

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A registry lookup found nothing, or found an entity whose refcount
    /// had already dropped to zero (teardown in progress).
    #[error("not found")]
    NotFound,

    /// An index half-setter (`set_control_data` / `set_file`) was called a
    /// second time on the same row.
    #[error("already set")]
    AlreadySet,

    /// A wire framing invariant failed: oversize header, unexpected message
    /// type during a handshake, version mismatch, etc.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Allocation failure or file-descriptor exhaustion.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An underlying read/write surfaced a non-retryable I/O error.
    #[error("io failure: {0}")]
    IoFailure(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
