use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// One name out of the shared identity namespace.
///
/// The namespace is the fixed candidate set `base_token + i` for
/// `i ∈ [0, max_peers)`. A live process claims exactly one candidate, owns
/// it for its whole lifetime and releases it implicitly by disconnecting.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl PeerIdentity {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<String> for PeerIdentity {
	fn from(raw: String) -> Self {
		Self(raw)
	}
}

impl From<&str> for PeerIdentity {
	fn from(raw: &str) -> Self {
		Self(raw.to_string())
	}
}

impl Display for PeerIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// The only configuration the pool takes: the shape of the identity
/// namespace.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PoolConfig {
	/// Prefix shared by every candidate name.
	pub base_token: String,
	/// Size of the namespace. A value of zero leaves nothing to claim and
	/// bootstrap fails with `NamespaceExhausted`.
	pub max_peers: usize,
}

impl PoolConfig {
	pub fn new(base_token: impl Into<String>, max_peers: usize) -> Self {
		Self {
			base_token: base_token.into(),
			max_peers,
		}
	}

	/// Candidate names in claim order.
	pub fn candidates(&self) -> impl Iterator<Item = PeerIdentity> + '_ {
		(0..self.max_peers).map(|i| PeerIdentity(format!("{}{i}", self.base_token)))
	}
}
