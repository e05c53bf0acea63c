//! Session registry — the sharded table of live sessions.
//!
//! Sessions are spread over `SHARD_COUNT` independent maps, each behind
//! its own reader/writer lock; a session lives in shard `id % SHARD_COUNT`
//! for its whole life. Registering hooks a close callback that removes the
//! session again, so the table only ever holds open sessions.
//!
//! Disposal holds each shard's write lock while it closes that shard's
//! sessions. The deregistration callbacks fired by those closes would want
//! the same lock, so once the `disposing` flag is up they skip the map and
//! only release their slot in the `outstanding` barrier.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::{watch, OnceCell};

use tether_core::{Codec, SessionError, SessionId, SessionIds};

use crate::session::{Session, SessionOptions};

/// Number of independently locked shards.
pub const SHARD_COUNT: usize = 32;

type Shard<C> = RwLock<HashMap<SessionId, Arc<Session<C>>>>;

struct RegistryInner<C: Codec> {
    shards: [Shard<C>; SHARD_COUNT],
    ids: SessionIds,
    disposing: AtomicBool,
    // Registered sessions whose close side effects have not finished yet.
    outstanding: watch::Sender<usize>,
    disposed: OnceCell<()>,
}

impl<C: Codec> RegistryInner<C> {
    fn shard(&self, id: SessionId) -> &Shard<C> {
        &self.shards[(id % SHARD_COUNT as u64) as usize]
    }

    fn deregister(&self, id: SessionId) {
        if !self.disposing.load(Ordering::Acquire) {
            self.shard(id).write().remove(&id);
            tracing::debug!(session_id = id, "session deregistered");
        }
        self.release();
    }

    fn acquire(&self) {
        self.outstanding.send_modify(|n| *n += 1);
    }

    fn release(&self) {
        self.outstanding.send_modify(|n| match n.checked_sub(1) {
            Some(v) => *n = v,
            None => tracing::error!("outstanding session count underflow"),
        });
    }
}

/// Cheaply cloneable handle; clones share the same table.
pub struct SessionRegistry<C: Codec> {
    inner: Arc<RegistryInner<C>>,
}

impl<C: Codec> Clone for SessionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Codec> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> SessionRegistry<C> {
    /// A registry drawing identifiers from the process-wide allocator.
    pub fn new() -> Self {
        Self::with_ids(SessionIds::process())
    }

    pub fn with_ids(ids: SessionIds) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
                ids,
                disposing: AtomicBool::new(false),
                outstanding,
                disposed: OnceCell::new(),
            }),
        }
    }

    pub fn ids(&self) -> &SessionIds {
        &self.inner.ids
    }

    /// Allocate an identifier, wrap `codec` in a session and register it.
    pub fn create_session(
        &self,
        codec: C,
        options: &SessionOptions,
    ) -> Result<Arc<Session<C>>, SessionError> {
        let session = Session::new(self.inner.ids.next(), codec, options);
        self.register(session.clone())?;
        Ok(session)
    }

    /// Insert `session` and arrange for it to leave the table when it closes.
    ///
    /// Fails with `Disposed` (closing the session) once disposal has begun,
    /// and with `Closed` if the session closed before the hook was in place.
    /// Registering an identifier that is already present is a no-op.
    pub fn register(&self, session: Arc<Session<C>>) -> Result<(), SessionError> {
        let id = session.id();
        {
            let mut shard = self.inner.shard(id).write();
            if self.inner.disposing.load(Ordering::Acquire) {
                drop(shard);
                tracing::warn!(session_id = id, "registration after disposal, closing session");
                let _ = session.close();
                return Err(SessionError::Disposed);
            }
            if shard.contains_key(&id) {
                return Ok(());
            }
            shard.insert(id, session.clone());
            self.inner.acquire();
        }

        let registry: Weak<RegistryInner<C>> = Arc::downgrade(&self.inner);
        let hooked = session.add_close_callback(move |s| {
            if let Some(registry) = registry.upgrade() {
                registry.deregister(s.id());
            }
        });
        if !hooked {
            self.inner.deregister(id);
            return Err(SessionError::Closed);
        }

        tracing::debug!(session_id = id, "session registered");
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.inner.shard(id).read().get(&id).cloned()
    }

    /// Point-in-time snapshot of every registered session. Sessions opened
    /// or closed while the shards are walked may or may not appear.
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        let mut all = Vec::new();
        for shard in &self.inner.shards {
            all.extend(shard.read().values().cloned());
        }
        all
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.shards.iter().all(|s| s.read().is_empty())
    }

    /// Registered sessions whose close side effects are still pending.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    pub fn is_disposing(&self) -> bool {
        self.inner.disposing.load(Ordering::Acquire)
    }

    /// Close every registered session and wait until all of their close
    /// callbacks have run. Runs once; concurrent and later callers wait for
    /// that single run to finish.
    ///
    /// Sessions are closed while their shard's write lock is held, so close
    /// callbacks must not call `get`, `len`, `sessions` or `register` on
    /// this registry.
    pub async fn dispose_all(&self) {
        let inner = &self.inner;
        inner
            .disposed
            .get_or_init(|| async move {
                inner.disposing.store(true, Ordering::Release);

                let mut closed = 0usize;
                for shard in &inner.shards {
                    let mut map = shard.write();
                    for (_, session) in map.drain() {
                        if !matches!(session.close(), Err(SessionError::Closed)) {
                            closed += 1;
                        }
                    }
                }

                // Sessions closed by other tasks may still be running callbacks.
                let mut outstanding = inner.outstanding.subscribe();
                loop {
                    let pending = *outstanding.borrow_and_update();
                    if pending == 0 || outstanding.changed().await.is_err() {
                        break;
                    }
                }

                tracing::info!(closed, "session registry disposed");
            })
            .await;
    }
}

impl<C: Codec> fmt::Debug for SessionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("len", &self.len())
            .field("outstanding", &self.outstanding())
            .field("disposing", &self.is_disposing())
            .finish()
    }
}
