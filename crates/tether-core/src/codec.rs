//! The stream/codec contract the session layer consumes.
//!
//! A codec turns a raw transport into a stream of whole messages. Framing,
//! checksums and type dispatch are the codec's business; the session layer
//! never inspects message contents.
//!
//! `receive` and `send` may suspend. `close` does not: it is called from
//! inside registry critical sections, so an implementation should only
//! signal its I/O halves to stop (and make pending reads return an error)
//! rather than wait for a graceful transport shutdown.

use std::future::Future;
use std::io;

use tokio::net::TcpStream;

pub trait Codec: Send + Sync + 'static {
    type Message: Send + 'static;

    /// Decode the next message. Any error, including end-of-stream
    /// (`io::ErrorKind::UnexpectedEof`), is terminal for the session.
    fn receive(&self) -> impl Future<Output = io::Result<Self::Message>> + Send;

    /// Encode and write one message.
    fn send(&self, msg: Self::Message) -> impl Future<Output = io::Result<()>> + Send;

    /// Release transport resources. Called at most once per session, but
    /// a second call must not corrupt state.
    fn close(&self) -> io::Result<()>;
}

/// Builds a codec on top of a freshly connected TCP stream.
pub trait Protocol: Send + Sync + 'static {
    type Codec: Codec;

    fn new_codec(&self, stream: TcpStream) -> io::Result<Self::Codec>;
}
