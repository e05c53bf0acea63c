//! Session — one live, framed, bidirectional message stream.
//!
//! A session owns its codec exclusively and closes it exactly once.
//! Sending is either synchronous (straight through the codec, the caller
//! keeps a single writer) or queued: messages go into a bounded queue that
//! one drain task writes out in FIFO order, and a full queue is reported as
//! `SessionError::Blocked` instead of suspending the caller.
//!
//! State is Open or Closed. The transition is a single compare-and-swap,
//! triggered by `close()` or by any stream error seen on send or receive.
//!
//! Close callbacks run synchronously on the task that wins the close race.
//! They must be quick and must not close the same session again. When the
//! close comes from `SessionRegistry::dispose_all` they run under that
//! registry's shard lock, so they must not call back into the registry.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use tether_core::config::SessionConfig;
use tether_core::throughput::{ThroughputCounter, DEFAULT_INTERVAL};
use tether_core::{Codec, SessionError, SessionId};

type CloseCallback<C> = Box<dyn FnOnce(&Session<C>) + Send>;

/// Per-session construction options.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Outbound queue capacity. 0 = synchronous send.
    pub send_queue_size: usize,
    pub throughput_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            send_queue_size: 0,
            throughput_interval: DEFAULT_INTERVAL,
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            send_queue_size: config.send_queue_size,
            throughput_interval: config.throughput_interval(),
        }
    }
}

pub struct Session<C: Codec> {
    id: SessionId,
    codec: C,
    send_tx: Option<mpsc::Sender<C::Message>>,
    closed: AtomicBool,
    close_signal: Arc<Notify>,
    // None once the close transition has taken the list.
    callbacks: Mutex<Option<Vec<CloseCallback<C>>>>,
    throughput: ThroughputCounter,
}

impl<C: Codec> Session<C> {
    /// Wrap a live codec. Spawns the drain task (queued mode) and the
    /// throughput sampler, so this must run inside a tokio runtime.
    pub fn new(id: SessionId, codec: C, options: &SessionOptions) -> Arc<Self> {
        let (send_tx, send_rx) = match options.send_queue_size {
            0 => (None, None),
            n => {
                let (tx, rx) = mpsc::channel(n);
                (Some(tx), Some(rx))
            }
        };

        let session = Arc::new(Self {
            id,
            codec,
            send_tx,
            closed: AtomicBool::new(false),
            close_signal: Arc::new(Notify::new()),
            callbacks: Mutex::new(Some(Vec::new())),
            throughput: ThroughputCounter::start(options.throughput_interval),
        });

        if let Some(rx) = send_rx {
            tokio::spawn(drain_outbound(
                Arc::downgrade(&session),
                rx,
                session.close_signal.clone(),
            ));
        }

        tracing::debug!(
            session_id = id,
            send_queue_size = options.send_queue_size,
            "session opened"
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True if sends go through the bounded outbound queue.
    pub fn is_queued(&self) -> bool {
        self.send_tx.is_some()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Messages sent plus messages received, sampled per interval.
    pub fn throughput(&self) -> &ThroughputCounter {
        &self.throughput
    }

    /// Send one message.
    ///
    /// Synchronous mode writes through the codec and returns its result; a
    /// write error closes the session. Queued mode never suspends: it
    /// enqueues or fails at once with `Blocked`.
    pub async fn send(&self, msg: C::Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let Some(tx) = &self.send_tx else {
            return match self.codec.send(msg).await {
                Ok(()) => {
                    self.throughput.add(1);
                    Ok(())
                }
                Err(e) => {
                    tracing::debug!(session_id = self.id, error = %e, "send failed, closing session");
                    let _ = self.close();
                    Err(SessionError::Stream(e))
                }
            };
        };

        match tx.try_send(msg) {
            Ok(()) => {
                self.throughput.add(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(SessionError::Blocked),
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    /// Read the next message. Only one caller may receive at a time.
    /// Any codec error, end-of-stream included, closes the session and is
    /// returned unchanged.
    pub async fn receive(&self) -> Result<C::Message, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        match self.codec.receive().await {
            Ok(msg) => {
                self.throughput.add(1);
                Ok(msg)
            }
            Err(e) => {
                tracing::debug!(session_id = self.id, error = %e, "receive failed, closing session");
                let _ = self.close();
                Err(SessionError::Stream(e))
            }
        }
    }

    /// Close the session. Exactly one caller wins; it closes the codec,
    /// stops the drain task and the sampler, runs the close callbacks in
    /// registration order, and sees the codec's close error if any. Every
    /// other caller gets `SessionError::Closed`.
    pub fn close(&self) -> Result<(), SessionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Closed);
        }

        let result = self.codec.close();
        self.close_signal.notify_one();
        self.throughput.stop();

        let callbacks = self.callbacks.lock().take().unwrap_or_default();
        for callback in callbacks {
            callback(self);
        }

        tracing::debug!(session_id = self.id, "session closed");
        result.map_err(SessionError::Stream)
    }

    /// Register a callback to run once when the session closes.
    ///
    /// Returns true if the callback will run. Returns false, dropping the
    /// callback, if the session was already closed.
    ///
    /// The callback may run inside `SessionRegistry::dispose_all` with a
    /// shard lock held; reading the owning registry from it deadlocks.
    pub fn add_close_callback<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&Session<C>) + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        match self.callbacks.lock().as_mut() {
            Some(list) => {
                list.push(Box::new(callback));
                true
            }
            None => false,
        }
    }
}

impl<C: Codec> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("queued", &self.is_queued())
            .finish()
    }
}

/// Drain task for queued sessions. Holds only a weak reference so a
/// session that is dropped without being closed still lets it exit.
async fn drain_outbound<C: Codec>(
    session: Weak<Session<C>>,
    mut rx: mpsc::Receiver<C::Message>,
    close_signal: Arc<Notify>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = close_signal.notified() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.codec.send(msg).await {
            tracing::debug!(session_id = session.id, error = %e, "outbound write failed");
            break;
        }
    }

    if let Some(session) = session.upgrade() {
        tracing::debug!(session_id = session.id, "drain task exiting");
        let _ = session.close();
    }
}
