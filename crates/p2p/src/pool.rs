use std::{
	collections::{HashMap, HashSet},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex, PoisonError, RwLock,
	},
	time::Duration,
};

use mb_event_bus::EventBus;
use tracing::{debug, info, trace, warn};

use crate::{
	Endpoint, IdentityError, Link, LinkDirection, LinkEvent, PeerIdentity, PoolConfig,
	RegisterError, SendError, Transport, TransportError,
};

/// State changes observed on the pool. Collaborators (the sync engine, the
/// UI) subscribe instead of hooking callbacks into the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
	/// A link to this peer reached its `open` state and entered the table.
	Connected(PeerIdentity),
	/// The table entry for this peer went away.
	Disconnected(PeerIdentity),
	/// A payload frame arrived from an open peer.
	Message { from: PeerIdentity, payload: Vec<u8> },
}

#[derive(Debug)]
struct PeerHandle {
	/// Distinguishes this link from a replacement under the same identity.
	link_id: u64,
	outgoing: flume::Sender<Vec<u8>>,
}

/// Outcome of inserting an opened link into the connection table.
enum Tabled {
	Inserted,
	/// Took over an existing entry for the same identity; not a new
	/// logical connection.
	Replaced,
	Rejected,
}

/// Owns the local identity and the connection table; keeps links to every
/// other reachable name in the namespace.
pub struct PeerPool {
	config: PoolConfig,
	identity: PeerIdentity,
	endpoint: Box<dyn Endpoint>,
	peers: RwLock<HashMap<PeerIdentity, PeerHandle>>,
	/// Names with a dial in flight, so a scan doesn't double-dial a peer
	/// whose link is still pending.
	dialing: Mutex<HashSet<PeerIdentity>>,
	events: EventBus<PoolEvent>,
	next_link_id: AtomicU64,
	shutdown: AtomicBool,
}

impl PeerPool {
	/// Claim an identity out of the namespace and start accepting incoming
	/// links.
	///
	/// Candidates are probed sequentially, in order, so a process never
	/// races itself for two slots. The first free name wins; if every slot
	/// is held this fails with [`IdentityError::NamespaceExhausted`] and the
	/// caller decides what to do.
	pub async fn bootstrap(
		transport: &dyn Transport,
		config: PoolConfig,
	) -> Result<Arc<Self>, IdentityError> {
		let (identity, endpoint) = Self::acquire_identity(transport, &config).await?;
		info!(%identity, "claimed identity slot");

		let pool = Arc::new(Self {
			config,
			identity,
			endpoint,
			peers: RwLock::new(HashMap::new()),
			dialing: Mutex::new(HashSet::new()),
			events: EventBus::new(),
			next_link_id: AtomicU64::new(0),
			shutdown: AtomicBool::new(false),
		});

		tokio::spawn(pool.clone().accept_loop());

		Ok(pool)
	}

	async fn acquire_identity(
		transport: &dyn Transport,
		config: &PoolConfig,
	) -> Result<(PeerIdentity, Box<dyn Endpoint>), IdentityError> {
		for candidate in config.candidates() {
			match transport.register(&candidate).await {
				Ok(endpoint) => return Ok((candidate, endpoint)),
				Err(RegisterError::NameUnavailable) => {
					trace!(%candidate, "identity slot taken, trying next");
				}
				Err(RegisterError::Transport(err)) => return Err(err.into()),
			}
		}

		Err(IdentityError::NamespaceExhausted(config.max_peers))
	}

	pub fn identity(&self) -> &PeerIdentity {
		&self.identity
	}

	pub fn events(&self) -> &EventBus<PoolEvent> {
		&self.events
	}

	/// Identities with an open table entry right now.
	pub fn connected_peers(&self) -> Vec<PeerIdentity> {
		let mut peers: Vec<_> = self
			.peers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.keys()
			.cloned()
			.collect();
		peers.sort();
		peers
	}

	pub fn is_connected(&self, peer: &PeerIdentity) -> bool {
		self.peers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.contains_key(peer)
	}

	/// Dial every candidate that is neither us, already tabled, nor mid-dial.
	///
	/// Meant to be invoked periodically: unconditional re-probing is the
	/// whole retry story for peers that were offline last time. A failed
	/// dial is only worth a trace; the next cycle tries again.
	pub async fn scan_and_connect(self: &Arc<Self>) {
		if self.shutdown.load(Ordering::Acquire) {
			return;
		}

		for candidate in self.config.candidates() {
			if candidate == self.identity || self.is_connected(&candidate) {
				continue;
			}
			if !self
				.dialing
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.insert(candidate.clone())
			{
				continue;
			}

			match self.endpoint.dial(&candidate).await {
				Ok(link) => self.clone().spawn_link(link),
				Err(err) => {
					trace!(%candidate, %err, "dial failed, will retry next scan");
					self.dialing
						.lock()
						.unwrap_or_else(PoisonError::into_inner)
						.remove(&candidate);
				}
			}
		}
	}

	/// Run [`Self::scan_and_connect`] forever on a fixed cadence, until
	/// shutdown.
	pub fn spawn_scan_loop(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
		let pool = self.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(every);
			loop {
				interval.tick().await;
				if pool.shutdown.load(Ordering::Acquire) {
					break;
				}
				pool.scan_and_connect().await;
			}
		})
	}

	/// Deliver `payload` to one open peer. No implicit connect: an absent
	/// or pending entry is [`SendError::NotConnected`].
	pub fn send(&self, to: &PeerIdentity, payload: Vec<u8>) -> Result<(), SendError> {
		let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
		let handle = peers
			.get(to)
			.ok_or_else(|| SendError::NotConnected(to.clone()))?;

		handle
			.outgoing
			.send(payload)
			.map_err(|_| SendError::Transport(TransportError::ChannelClosed))
	}

	/// Best-effort fan-out to every open peer. A failing link is logged and
	/// skipped; returns how many peers the payload reached.
	pub fn broadcast(&self, payload: &[u8]) -> usize {
		let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
		let mut delivered = 0;
		for (identity, handle) in peers.iter() {
			if handle.outgoing.send(payload.to_vec()).is_ok() {
				delivered += 1;
			} else {
				warn!(%identity, "broadcast skipped a dead link");
			}
		}
		delivered
	}

	/// Tear down every link and release the identity. Idempotent and safe
	/// to call from a process-exit hook.
	pub async fn shutdown(&self) {
		if self.shutdown.swap(true, Ordering::AcqRel) {
			return;
		}

		let drained: Vec<_> = {
			let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
			peers.drain().collect()
		};
		// Dropping the handles closes the links; the remote sides observe
		// `Closed` through their transports.
		for (identity, _) in drained {
			self.events.emit(PoolEvent::Disconnected(identity));
		}

		self.endpoint.close().await;
		info!(identity = %self.identity, "peer pool shut down");
	}

	async fn accept_loop(self: Arc<Self>) {
		while let Some(link) = self.endpoint.accept().await {
			if self.shutdown.load(Ordering::Acquire) {
				break;
			}
			trace!(remote = %link.remote, "incoming link");
			self.clone().spawn_link(link);
		}
	}

	/// Drive one link through `pending → open → closed`, mirroring it into
	/// the connection table while open.
	fn spawn_link(self: Arc<Self>, link: Link) {
		let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
		tokio::spawn(async move {
			let Link {
				remote,
				direction,
				outgoing,
				events,
			} = link;
			let mut open = false;

			while let Ok(event) = events.recv_async().await {
				match event {
					LinkEvent::Open => {
						self.clear_dialing(&remote);
						match self.table_link(&remote, direction, link_id, &outgoing) {
							Tabled::Inserted => {
								open = true;
								self.events.emit(PoolEvent::Connected(remote.clone()));
							}
							Tabled::Replaced => open = true,
							// A parallel link to the same peer won; drop ours.
							Tabled::Rejected => return,
						}
					}
					LinkEvent::Data(payload) => {
						self.events.emit(PoolEvent::Message {
							from: remote.clone(),
							payload,
						});
					}
					LinkEvent::Closed => break,
					LinkEvent::Error(err) => {
						warn!(%remote, %err, "link error");
						if !open {
							// A pending attempt died; the next scan retries.
							break;
						}
					}
				}
			}

			self.clear_dialing(&remote);
			if open && self.untable_link(&remote, link_id) {
				self.events.emit(PoolEvent::Disconnected(remote.clone()));
			}
		});
	}

	/// Insert an opened link into the table. At most one entry may exist
	/// per remote identity; when two peers dial each other simultaneously,
	/// both deterministically keep the link dialed by the smaller identity.
	fn table_link(
		&self,
		remote: &PeerIdentity,
		direction: LinkDirection,
		link_id: u64,
		outgoing: &flume::Sender<Vec<u8>>,
	) -> Tabled {
		use std::collections::hash_map::Entry;

		let preferred = if self.identity < *remote {
			LinkDirection::Outbound
		} else {
			LinkDirection::Inbound
		};

		let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
		match peers.entry(remote.clone()) {
			Entry::Vacant(entry) => {
				entry.insert(PeerHandle {
					link_id,
					outgoing: outgoing.clone(),
				});
				debug!(%remote, "peer connected");
				Tabled::Inserted
			}
			Entry::Occupied(mut entry) => {
				if direction == preferred {
					trace!(%remote, "replacing duplicate link with preferred direction");
					entry.insert(PeerHandle {
						link_id,
						outgoing: outgoing.clone(),
					});
					Tabled::Replaced
				} else {
					trace!(%remote, "dropping duplicate link");
					Tabled::Rejected
				}
			}
		}
	}

	/// Remove our entry, but only if it still belongs to this link.
	fn untable_link(&self, remote: &PeerIdentity, link_id: u64) -> bool {
		let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
		if peers.get(remote).is_some_and(|h| h.link_id == link_id) {
			peers.remove(remote);
			debug!(%remote, "peer disconnected");
			return true;
		}
		false
	}

	fn clear_dialing(&self, remote: &PeerIdentity) {
		self.dialing
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(remote);
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::time::timeout;
	use tracing_test::traced_test;

	use super::*;
	use crate::MemoryTransport;

	const WAIT: Duration = Duration::from_secs(2);

	fn config() -> PoolConfig {
		PoolConfig::new("X-", 3)
	}

	async fn wait_for(
		rx: &flume::Receiver<PoolEvent>,
		mut pred: impl FnMut(&PoolEvent) -> bool,
	) -> PoolEvent {
		timeout(WAIT, async {
			loop {
				let event = rx.recv_async().await.expect("event bus closed");
				if pred(&event) {
					return event;
				}
			}
		})
		.await
		.expect("timed out waiting for pool event")
	}

	#[tokio::test]
	async fn identities_are_claimed_in_order() {
		let transport = MemoryTransport::new();

		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let b = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let c = PeerPool::bootstrap(&transport, config()).await.unwrap();

		assert_eq!(a.identity().as_str(), "X-0");
		assert_eq!(b.identity().as_str(), "X-1");
		assert_eq!(c.identity().as_str(), "X-2");
	}

	#[tokio::test]
	async fn full_namespace_is_exhausted() {
		let transport = MemoryTransport::new();

		let _pools = [
			PeerPool::bootstrap(&transport, config()).await.unwrap(),
			PeerPool::bootstrap(&transport, config()).await.unwrap(),
			PeerPool::bootstrap(&transport, config()).await.unwrap(),
		];

		assert!(matches!(
			PeerPool::bootstrap(&transport, config()).await,
			Err(IdentityError::NamespaceExhausted(3))
		));
	}

	#[tokio::test]
	async fn scan_connects_both_sides() {
		let transport = MemoryTransport::new();
		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let b = PeerPool::bootstrap(&transport, config()).await.unwrap();

		let a_events = a.events().subscribe();
		let b_events = b.events().subscribe();

		b.scan_and_connect().await;

		wait_for(&a_events, |e| matches!(e, PoolEvent::Connected(p) if p == b.identity())).await;
		wait_for(&b_events, |e| matches!(e, PoolEvent::Connected(p) if p == a.identity())).await;

		assert!(a.is_connected(b.identity()));
		assert!(b.is_connected(a.identity()));
	}

	#[traced_test]
	#[tokio::test]
	async fn mutual_scan_keeps_one_link_per_peer() {
		let transport = MemoryTransport::new();
		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let b = PeerPool::bootstrap(&transport, config()).await.unwrap();

		let a_events = a.events().subscribe();
		let b_events = b.events().subscribe();

		tokio::join!(a.scan_and_connect(), b.scan_and_connect());

		wait_for(&a_events, |e| matches!(e, PoolEvent::Connected(_))).await;
		wait_for(&b_events, |e| matches!(e, PoolEvent::Connected(_))).await;

		assert_eq!(a.connected_peers(), vec![b.identity().clone()]);
		assert_eq!(b.connected_peers(), vec![a.identity().clone()]);

		// The surviving pair of links still carries traffic both ways.
		a.send(b.identity(), b"ping".to_vec()).unwrap();
		wait_for(&b_events, |e| {
			matches!(e, PoolEvent::Message { payload, .. } if payload == b"ping")
		})
		.await;
		b.send(a.identity(), b"pong".to_vec()).unwrap();
		wait_for(&a_events, |e| {
			matches!(e, PoolEvent::Message { payload, .. } if payload == b"pong")
		})
		.await;
	}

	#[tokio::test]
	async fn send_without_connection_fails() {
		let transport = MemoryTransport::new();
		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();

		assert!(matches!(
			a.send(&PeerIdentity::from("X-1"), b"hi".to_vec()),
			Err(SendError::NotConnected(_))
		));
	}

	#[tokio::test]
	async fn broadcast_reaches_every_open_peer() {
		let transport = MemoryTransport::new();
		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let b = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let c = PeerPool::bootstrap(&transport, config()).await.unwrap();

		let a_events = a.events().subscribe();
		let b_events = b.events().subscribe();
		let c_events = c.events().subscribe();

		a.scan_and_connect().await;
		wait_for(&b_events, |e| matches!(e, PoolEvent::Connected(_))).await;
		wait_for(&c_events, |e| matches!(e, PoolEvent::Connected(_))).await;
		wait_for(&a_events, |e| matches!(e, PoolEvent::Connected(_))).await;
		wait_for(&a_events, |e| matches!(e, PoolEvent::Connected(_))).await;

		assert_eq!(a.broadcast(b"fan-out"), 2);

		wait_for(&b_events, |e| {
			matches!(e, PoolEvent::Message { payload, .. } if payload == b"fan-out")
		})
		.await;
		wait_for(&c_events, |e| {
			matches!(e, PoolEvent::Message { payload, .. } if payload == b"fan-out")
		})
		.await;
	}

	#[tokio::test]
	async fn broadcast_skips_a_dead_link() {
		let transport = MemoryTransport::new();
		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let b = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let c = PeerPool::bootstrap(&transport, config()).await.unwrap();

		let a_events = a.events().subscribe();
		let c_events = c.events().subscribe();

		a.scan_and_connect().await;
		wait_for(&a_events, |e| matches!(e, PoolEvent::Connected(_))).await;
		wait_for(&a_events, |e| matches!(e, PoolEvent::Connected(_))).await;

		// Sever B's link half underneath its table entry, before the reap.
		let (dead_tx, dead_rx) = flume::unbounded();
		drop(dead_rx);
		a.peers
			.write()
			.unwrap()
			.get_mut(b.identity())
			.unwrap()
			.outgoing = dead_tx;

		// The broken link is skipped; the surviving peer still gets it.
		assert_eq!(a.broadcast(b"fan-out"), 1);
		wait_for(&c_events, |e| {
			matches!(e, PoolEvent::Message { payload, .. } if payload == b"fan-out")
		})
		.await;
	}

	#[tokio::test]
	async fn shutdown_is_idempotent_and_releases_the_slot() {
		let transport = MemoryTransport::new();
		let a = PeerPool::bootstrap(&transport, config()).await.unwrap();
		let b = PeerPool::bootstrap(&transport, config()).await.unwrap();

		let b_events = b.events().subscribe();
		b.scan_and_connect().await;
		wait_for(&b_events, |e| matches!(e, PoolEvent::Connected(_))).await;

		a.shutdown().await;
		a.shutdown().await;

		wait_for(&b_events, |e| matches!(e, PoolEvent::Disconnected(p) if p.as_str() == "X-0"))
			.await;

		// The slot is free again for the next process.
		let successor = PeerPool::bootstrap(&transport, config()).await.unwrap();
		assert_eq!(successor.identity().as_str(), "X-0");
	}
}
