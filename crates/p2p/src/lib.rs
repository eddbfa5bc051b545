//! Peer discovery and connection pool.
//!
//! Peers claim an identity out of a fixed, well-known namespace
//! (`base_token + i`) instead of using a rendezvous directory, then keep
//! probing every other slot so that peers coming online later are still
//! found. The underlying point-to-point transport is a capability consumed
//! through the [`Transport`] trait; an in-memory implementation ships here
//! for tests and single-process use.

mod error;
mod identity;
mod memory;
mod pool;
mod transport;

pub use error::{IdentityError, SendError, TransportError};
pub use identity::{PeerIdentity, PoolConfig};
pub use memory::MemoryTransport;
pub use pool::{PeerPool, PoolEvent};
pub use transport::{Endpoint, Link, LinkDirection, LinkEvent, RegisterError, Transport};
