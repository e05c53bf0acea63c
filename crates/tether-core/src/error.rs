//! Error taxonomy for sessions, registries and pools.
//!
//! Every failure is scoped to one session or one pool operation; nothing
//! here is fatal to the process.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The session's close transition has already completed.
    #[error("session closed")]
    Closed,

    /// The outbound queue is full. Backpressure, not a fatal error.
    #[error("session blocked")]
    Blocked,

    /// The underlying stream failed during read, write or close.
    #[error(transparent)]
    Stream(#[from] io::Error),

    /// The pool could not pick a session.
    #[error("no session available in pool")]
    Unavailable,

    /// The connection factory failed to produce a stream.
    #[error("failed to establish connection: {0}")]
    Factory(#[source] io::Error),

    /// The registry has started (or finished) disposing its sessions.
    #[error("session registry disposed")]
    Disposed,

    #[error("pool is already being served")]
    AlreadyServing,
}

impl SessionError {
    /// True for errors that only signal backpressure.
    pub fn is_blocked(&self) -> bool {
        matches!(self, SessionError::Blocked)
    }

    /// True for errors returned because the session is no longer open.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}
