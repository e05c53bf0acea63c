//! Connection factories — how a pool obtains fresh codecs.
//!
//! Anything implementing `Connect` will do. Plain closures returning a
//! future of `io::Result<C>` qualify through the blanket impl; `TcpDialer`
//! dials a TCP address with a timeout and hands the stream to a `Protocol`.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use tether_core::config::DialConfig;
use tether_core::{Codec, Protocol};

pub trait Connect: Send + Sync + 'static {
    type Codec: Codec;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Codec>> + Send;
}

impl<F, Fut, C> Connect for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send,
    C: Codec,
{
    type Codec = C;

    fn connect(&self) -> impl Future<Output = io::Result<C>> + Send {
        (self)()
    }
}

/// Dials `address` over TCP and builds a codec with `protocol`.
#[derive(Debug, Clone)]
pub struct TcpDialer<P> {
    address: String,
    timeout: Duration,
    protocol: P,
}

impl<P: Protocol> TcpDialer<P> {
    pub fn new(address: impl Into<String>, protocol: P) -> Self {
        Self {
            address: address.into(),
            timeout: DialConfig::default().connect_timeout(),
            protocol,
        }
    }

    pub fn from_config(address: impl Into<String>, protocol: P, config: &DialConfig) -> Self {
        Self::new(address, protocol).with_timeout(config.connect_timeout())
    }

    /// Connect timeout. Zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        if self.timeout.is_zero() {
            return TcpStream::connect(&self.address).await;
        }
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", self.address, self.timeout),
            )),
        }
    }
}

impl<P: Protocol> Connect for TcpDialer<P> {
    type Codec = P::Codec;

    async fn connect(&self) -> io::Result<P::Codec> {
        let stream = self.dial().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(address = %self.address, "connection established");
        self.protocol.new_codec(stream)
    }
}
