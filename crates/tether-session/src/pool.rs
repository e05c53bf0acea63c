//! Connection pool — adaptive, load-balanced client sessions.
//!
//! `get_session` hands out the least busy session (lowest sampled
//! throughput; the first idle one wins outright). The pool grows itself in
//! the background whenever that session is running faster than
//! `max_speed` or fewer than `min_sessions` sessions exist. Growth never
//! delays the caller and its failures are only logged.
//!
//! An empty pool dials its first session inline, so a dial failure on that
//! path is returned to the caller as `SessionError::Factory`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use tether_core::config::{DEFAULT_MAX_SPEED, DEFAULT_MIN_SESSIONS};
use tether_core::{SessionError, SessionId, TetherConfig};

use crate::connect::Connect;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionOptions};

type PooledSession<K> = Arc<Session<<K as Connect>::Codec>>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_sessions: u64,
    /// Units/second.
    pub max_speed: u64,
    pub session: SessionOptions,
}

impl PoolSettings {
    /// Zero `min_sessions`/`max_speed` fall back to 1 and 15.
    pub fn new(min_sessions: u64, max_speed: u64, session: SessionOptions) -> Self {
        Self {
            min_sessions: if min_sessions == 0 { DEFAULT_MIN_SESSIONS } else { min_sessions },
            max_speed: if max_speed == 0 { DEFAULT_MAX_SPEED } else { max_speed },
            session,
        }
    }

    pub fn from_config(config: &TetherConfig) -> Self {
        let (min_sessions, max_speed) = config.pool.normalized();
        Self::new(min_sessions, max_speed, SessionOptions::from(&config.session))
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SESSIONS, DEFAULT_MAX_SPEED, SessionOptions::default())
    }
}

struct PoolInner<K: Connect> {
    registry: SessionRegistry<K::Codec>,
    connector: K,
    settings: PoolSettings,
    serving: AtomicBool,
    new_tx: mpsc::UnboundedSender<PooledSession<K>>,
    new_rx: Mutex<Option<mpsc::UnboundedReceiver<PooledSession<K>>>>,
    stopped: watch::Sender<bool>,
}

impl<K: Connect> PoolInner<K> {
    async fn create_session(&self) -> Result<PooledSession<K>, SessionError> {
        let codec = self.connector.connect().await.map_err(SessionError::Factory)?;
        let session = self.registry.create_session(codec, &self.settings.session)?;
        if self.serving.load(Ordering::Acquire) {
            let _ = self.new_tx.send(session.clone());
        }
        Ok(session)
    }

    /// First idle session, else the one with the lowest rate.
    fn least_busy(&self) -> Option<(PooledSession<K>, u64)> {
        let mut best: Option<(PooledSession<K>, u64)> = None;
        for session in self.registry.sessions() {
            if session.is_closed() {
                continue;
            }
            let rate = session.throughput().rate();
            if rate == 0 {
                return Some((session, 0));
            }
            match &best {
                Some((_, lowest)) if *lowest <= rate => {}
                _ => best = Some((session, rate)),
            }
        }
        best
    }
}

/// Holds the new-session receiver for one `serve` call. Dropping it, on
/// return or on cancellation, lowers the serving flag and hands the
/// receiver back to the pool.
struct ServeGuard<'a, K: Connect> {
    inner: &'a PoolInner<K>,
    rx: Option<mpsc::UnboundedReceiver<PooledSession<K>>>,
}

impl<K: Connect> ServeGuard<'_, K> {
    async fn recv(&mut self) -> Option<PooledSession<K>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl<K: Connect> Drop for ServeGuard<'_, K> {
    fn drop(&mut self) {
        self.inner.serving.store(false, Ordering::Release);
        if let Some(mut rx) = self.rx.take() {
            // The next serve picks these up from its registry snapshot.
            while rx.try_recv().is_ok() {}
            *self.inner.new_rx.lock() = Some(rx);
        }
    }
}

/// Cheaply cloneable handle; clones share the same pool.
pub struct ConnectionPool<K: Connect> {
    inner: Arc<PoolInner<K>>,
}

impl<K: Connect> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Connect> ConnectionPool<K> {
    pub fn new(connector: K, settings: PoolSettings) -> Self {
        Self::with_registry(connector, settings, SessionRegistry::new())
    }

    /// Build on an existing (typically empty) registry.
    pub fn with_registry(
        connector: K,
        settings: PoolSettings,
        registry: SessionRegistry<K::Codec>,
    ) -> Self {
        let settings = PoolSettings::new(settings.min_sessions, settings.max_speed, settings.session);
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                registry,
                connector,
                settings,
                serving: AtomicBool::new(false),
                new_tx,
                new_rx: Mutex::new(Some(new_rx)),
                stopped,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry<K::Codec> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// A session to use right now.
    pub async fn get_session(&self) -> Result<PooledSession<K>, SessionError> {
        let inner = &self.inner;
        if inner.registry.is_empty() {
            inner.create_session().await?;
        }

        let (session, rate) = inner.least_busy().ok_or(SessionError::Unavailable)?;

        let size = inner.registry.len() as u64;
        if rate > inner.settings.max_speed || size < inner.settings.min_sessions {
            tracing::debug!(
                session_id = session.id(),
                rate,
                size,
                "least busy session over budget, growing pool"
            );
            self.grow();
        }
        Ok(session)
    }

    /// Dial one more session in the background.
    fn grow(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.create_session().await {
                Ok(session) => tracing::info!(
                    session_id = session.id(),
                    size = inner.registry.len(),
                    "pool grew"
                ),
                Err(e) => tracing::warn!(error = %e, "pool growth failed"),
            }
        });
    }

    /// Run `handler` on its own task for every pool session: the ones
    /// already open and every one the pool creates from now on. Returns
    /// after `stop()`. Dropping the future ends serving as well, and the
    /// pool can be served again afterwards.
    pub async fn serve<H, Fut>(&self, handler: H) -> Result<(), SessionError>
    where
        H: Fn(PooledSession<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self
            .inner
            .new_rx
            .lock()
            .take()
            .ok_or(SessionError::AlreadyServing)?;
        let mut guard = ServeGuard {
            inner: &self.inner,
            rx: Some(rx),
        };
        let mut stopped = self.inner.stopped.subscribe();

        // Raise the flag before the snapshot so a session created in between
        // shows up in at least one of the two; `seen` drops the duplicate.
        self.inner.serving.store(true, Ordering::Release);
        let mut seen: HashSet<SessionId> = HashSet::new();
        for session in self.inner.registry.sessions() {
            seen.insert(session.id());
            tokio::spawn(handler(session));
        }

        loop {
            let stop = *stopped.borrow_and_update();
            if stop {
                break;
            }
            tokio::select! {
                changed = stopped.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = guard.recv() => match next {
                    Some(session) => {
                        if !seen.remove(&session.id()) {
                            tokio::spawn(handler(session));
                        }
                    }
                    None => break,
                },
            }
        }

        tracing::debug!("pool serve loop exited");
        Ok(())
    }

    /// End `serve` and dispose every pooled session.
    pub async fn stop(&self) {
        self.inner.stopped.send_replace(true);
        self.inner.registry.dispose_all().await;
    }
}
