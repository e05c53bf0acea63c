//! Session identifier allocation.
//!
//! Identifiers are 64-bit, start at 1, increase monotonically and are
//! never reused. One allocator is shared by everything that should draw
//! from the same sequence; `SessionIds::process()` is the process-wide one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

pub type SessionId = u64;

/// Cloneable handle over a shared identifier counter.
#[derive(Debug, Clone, Default)]
pub struct SessionIds {
    last: Arc<AtomicU64>,
}

static PROCESS_IDS: OnceLock<SessionIds> = OnceLock::new();

impl SessionIds {
    /// A fresh, independent sequence. Mostly useful for tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// The allocator shared by the whole process.
    pub fn process() -> Self {
        PROCESS_IDS.get_or_init(SessionIds::new).clone()
    }

    pub fn next(&self) -> SessionId {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently issued identifier, 0 if none yet.
    pub fn last(&self) -> SessionId {
        self.last.load(Ordering::Relaxed)
    }
}
