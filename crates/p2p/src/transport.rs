use async_trait::async_trait;
use thiserror::Error;

use crate::{PeerIdentity, TransportError};

/// Lifecycle signals of a single link, delivered in order. A link is
/// `pending` from creation until `Open` arrives, then `open` until `Closed`.
/// `Error` is connection-scoped and terminal for a pending link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
	Open,
	Data(Vec<u8>),
	Closed,
	Error(String),
}

/// Which side initiated the link. Used to pick a deterministic survivor
/// when two peers dial each other simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
	Outbound,
	Inbound,
}

/// One point-to-point connection attempt, pending until its `Open` event.
///
/// `outgoing` carries raw payload frames to the remote; `events` yields the
/// lifecycle signals and inbound frames. The transport is responsible for
/// pumping both ends; dropping `outgoing` closes the link.
#[derive(Debug)]
pub struct Link {
	pub remote: PeerIdentity,
	pub direction: LinkDirection,
	pub outgoing: flume::Sender<Vec<u8>>,
	pub events: flume::Receiver<LinkEvent>,
}

#[derive(Debug, Error)]
pub enum RegisterError {
	/// Another live endpoint already holds this name. Recoverable: try the
	/// next candidate.
	#[error("identity is already claimed")]
	NameUnavailable,
	#[error(transparent)]
	Transport(#[from] TransportError),
}

/// The point-to-point transport capability.
///
/// Implementations handle NAT traversal, session negotiation and framing;
/// this crate only consumes the surface below.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	/// Atomically claim `identity` in the shared namespace, or reject if a
	/// live endpoint already holds it. The claim is released when the
	/// returned endpoint closes (or is dropped).
	async fn register(&self, identity: &PeerIdentity) -> Result<Box<dyn Endpoint>, RegisterError>;
}

/// A transport endpoint bound to a claimed identity.
#[async_trait]
pub trait Endpoint: Send + Sync {
	fn identity(&self) -> &PeerIdentity;

	/// Start a connection attempt towards `to`. The returned link is
	/// pending; wait for its `Open` event before sending.
	async fn dial(&self, to: &PeerIdentity) -> Result<Link, TransportError>;

	/// Wait for the next incoming link. `None` once the endpoint closed.
	async fn accept(&self) -> Option<Link>;

	/// Close every link and release the identity claim. Idempotent.
	async fn close(&self);
}
