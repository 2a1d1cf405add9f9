use std::path::PathBuf;

use thiserror::Error;

/// Failure classes the workers convert I/O and protocol errors into.
///
/// Workers never panic the process; a dispatcher treats a worker failure
/// as a normal return, releases the admission slot and reconsiders the
/// item on its next tick.
#[derive(Error, Debug)]
pub enum GuardError {
    /// The filesystem refused the identity tag; the item stays untracked
    /// for this event.
    #[error("extended attributes unsupported for {0:?}")]
    TaggingUnsupported(PathBuf),

    /// The bounded event queue rejected a push.
    #[error("event queue full")]
    QueueFull,

    /// Remote peer unreachable or timed out; state is preserved and the
    /// next tick retries.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Resume probe mismatch or session no longer in progress; the
    /// endpoint abandons the session and initiates a fresh one.
    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    /// End-to-end verification failed.
    #[error("hash mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },

    /// Corrupted persistent state, surfaced to operator logs.
    #[error("fatal state: {0}")]
    Fatal(String),
}
