//! tether-core — shared types for the Tether session layer: the codec
//! contract, error taxonomy, identifiers, throughput accounting and config.
//! All other Tether crates depend on this one.

pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod throughput;

pub use codec::{Codec, Protocol};
pub use config::TetherConfig;
pub use error::SessionError;
pub use id::{SessionId, SessionIds};
pub use throughput::ThroughputCounter;
