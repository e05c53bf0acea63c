//! tether-session — sessions over framed message streams, the sharded
//! session registry, and the adaptive client-side connection pool.

pub mod connect;
pub mod pool;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use connect::{Connect, TcpDialer};
pub use pool::{ConnectionPool, PoolSettings};
pub use registry::{SessionRegistry, SHARD_COUNT};
pub use session::{Session, SessionOptions};

pub use tether_core::{Codec, Protocol, SessionError, SessionId, SessionIds, TetherConfig};
