//! Scripted in-memory codec shared by the unit tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};

use tether_core::Codec;

struct MockState {
    sent: Mutex<Vec<String>>,
    send_attempts: AtomicUsize,
    close_calls: AtomicUsize,
    fail_sends: AtomicBool,
    fail_close: AtomicBool,
    gate: Option<Semaphore>,
    closed: watch::Sender<bool>,
    inbound: mpsc::UnboundedSender<io::Result<String>>,
}

pub(crate) struct MockCodec {
    state: Arc<MockState>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<String>>>,
}

/// Test-side view of a `MockCodec`.
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<MockState>,
}

impl MockCodec {
    pub(crate) fn new() -> (Self, MockHandle) {
        Self::build(None)
    }

    /// Every write waits for a permit from `MockHandle::release`.
    pub(crate) fn gated() -> (Self, MockHandle) {
        Self::build(Some(Semaphore::new(0)))
    }

    fn build(gate: Option<Semaphore>) -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let state = Arc::new(MockState {
            sent: Mutex::new(Vec::new()),
            send_attempts: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            gate,
            closed,
            inbound: tx,
        });
        let codec = MockCodec {
            state: state.clone(),
            inbound: tokio::sync::Mutex::new(rx),
        };
        (codec, MockHandle { state })
    }
}

impl Codec for MockCodec {
    type Message = String;

    async fn receive(&self) -> io::Result<String> {
        let mut closed = self.state.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            msg = inbound.recv() => {
                msg.unwrap_or_else(|| Err(io::ErrorKind::UnexpectedEof.into()))
            }
            _ = wait_closed(&mut closed) => {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "codec closed"))
            }
        }
    }

    async fn send(&self, msg: String) -> io::Result<()> {
        self.state.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.state.gate {
            gate.acquire()
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::Other))?
                .forget();
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.state.sent.lock().push(msg);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closed.send_replace(true);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "close failed"));
        }
        Ok(())
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

impl MockHandle {
    pub(crate) fn push(&self, msg: &str) {
        let _ = self.state.inbound.send(Ok(msg.to_string()));
    }

    pub(crate) fn push_err(&self, kind: io::ErrorKind) {
        let _ = self.state.inbound.send(Err(kind.into()));
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    pub(crate) fn send_attempts(&self) -> usize {
        self.state.send_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, permits: usize) {
        if let Some(gate) = &self.state.gate {
            gate.add_permits(permits);
        }
    }
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
