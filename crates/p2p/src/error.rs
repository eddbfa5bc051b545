use thiserror::Error;

use crate::PeerIdentity;

/// Connection-scoped transport failures. These never affect other links.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
	#[error("no route to {0}")]
	Unreachable(PeerIdentity),
	#[error("link channel closed")]
	ChannelClosed,
	#[error("{0}")]
	Other(String),
}

/// Failure to claim a local identity out of the shared namespace.
#[derive(Debug, Error)]
pub enum IdentityError {
	/// Every candidate slot is held by a live peer. Fatal for this process;
	/// the caller decides whether to give up or start over.
	#[error("all {0} identity slots are claimed")]
	NamespaceExhausted(usize),
	#[error("transport error while claiming identity: {0}")]
	Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SendError {
	/// The target has no open entry in the connection table. There is no
	/// implicit connect-on-send; the next scan cycle is the retry path.
	#[error("no open connection to {0}")]
	NotConnected(PeerIdentity),
	#[error(transparent)]
	Transport(#[from] TransportError),
}
