use std::{collections::BTreeSet, sync::Arc};

use mb_event_bus::EventBus;
use mb_p2p::{PeerIdentity, PeerPool, PoolEvent};
use mb_sync::{merge_journals, OperateKind, OperationRecord};
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use crate::{Message, OperationLog, Resource, SyncError, JOURNAL_STORE};

/// Engine-level observations, mostly for the presentation layer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
	/// A store's contents changed under the reader's feet; re-read it.
	Applied { store_name: String },
	/// One merge round against a peer finished; `applied` counts the
	/// operations that actually landed.
	RoundCompleted { peer: PeerIdentity, applied: usize },
	/// A response arrived for a plain store read we requested earlier.
	Fetched { resource: String, data: Option<Value> },
}

/// Stateless protocol handler driving journal exchange over the pool.
///
/// Holds no per-round state: every response is interpreted by its resource
/// id alone, so a peer that never answers leaks nothing. Both ends of a
/// fresh link observe `Connected` and each pulls the other's journal, which
/// makes a round bidirectional without a push path.
pub struct SyncEngine {
	pool: Arc<PeerPool>,
	log: Arc<OperationLog>,
	events: EventBus<SyncEvent>,
}

impl SyncEngine {
	pub fn new(pool: Arc<PeerPool>, log: Arc<OperationLog>) -> Arc<Self> {
		Arc::new(Self {
			pool,
			log,
			events: EventBus::new(),
		})
	}

	pub fn events(&self) -> &EventBus<SyncEvent> {
		&self.events
	}

	pub fn pool(&self) -> &Arc<PeerPool> {
		&self.pool
	}

	pub fn log(&self) -> &Arc<OperationLog> {
		&self.log
	}

	/// React to pool events until the pool shuts down.
	pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let engine = self.clone();
		let events = engine.pool.events().subscribe();
		tokio::spawn(async move {
			while let Ok(event) = events.recv_async().await {
				match event {
					PoolEvent::Connected(peer) => {
						if let Err(err) = engine.request_journal(&peer) {
							warn!(%peer, %err, "failed to start sync round");
						}
					}
					PoolEvent::Message { from, payload } => {
						if let Err(err) = engine.handle_message(&from, &payload).await {
							warn!(%from, %err, "failed to handle peer message");
						}
					}
					PoolEvent::Disconnected(peer) => {
						trace!(%peer, "peer went away");
					}
				}
			}
		})
	}

	/// Ask `peer` for its full journal, starting a merge round.
	pub fn request_journal(&self, peer: &PeerIdentity) -> Result<(), SyncError> {
		debug!(%peer, "requesting journal");
		self.send(
			peer,
			&Message::Request {
				from: self.pool.identity().clone(),
				to: peer.clone(),
				id: JOURNAL_STORE.to_string(),
			},
		)
	}

	/// Ask `peer` for a plain store resource; the answer surfaces as a
	/// [`SyncEvent::Fetched`].
	pub fn request_resource(&self, peer: &PeerIdentity, id: &str) -> Result<(), SyncError> {
		self.send(
			peer,
			&Message::Request {
				from: self.pool.identity().clone(),
				to: peer.clone(),
				id: id.to_string(),
			},
		)
	}

	/// Journal and perform a local mutation, then propagate the resolved
	/// operation to every open peer so it lands without waiting for their
	/// next journal pull.
	pub async fn record(
		&self,
		store_name: &str,
		operate: OperateKind,
		key: Option<String>,
		data: Option<Value>,
	) -> Result<OperationRecord, SyncError> {
		let record = self.log.append(store_name, operate, key, data).await?;
		self.events.emit(SyncEvent::Applied {
			store_name: store_name.to_string(),
		});

		let id = match &record.key {
			Some(key) => Resource::record(store_name, key),
			None => store_name.to_string(),
		};
		for peer in self.pool.connected_peers() {
			let message = Message::Response {
				from: self.pool.identity().clone(),
				to: peer.clone(),
				id: id.clone(),
				data: record.data.clone(),
				operate: Some(record.operate),
			};
			if let Err(err) = self.send(&peer, &message) {
				warn!(%peer, %err, "failed to propagate operation");
			}
		}

		Ok(record)
	}

	#[instrument(skip(self, payload))]
	pub async fn handle_message(
		&self,
		from: &PeerIdentity,
		payload: &[u8],
	) -> Result<(), SyncError> {
		match serde_json::from_slice(payload)? {
			Message::Request { id, .. } => self.answer_request(from, &id).await,
			Message::Response {
				id, data, operate, ..
			} => match operate {
				Some(kind) => self.apply_propagated(&id, kind, data).await,
				None if Resource::parse(&id) == Resource::Journal => {
					self.merge_remote_journal(from, data).await
				}
				None => {
					self.events.emit(SyncEvent::Fetched { resource: id, data });
					Ok(())
				}
			},
		}
	}

	/// Answer a peer's read with the requested resource.
	async fn answer_request(&self, requester: &PeerIdentity, id: &str) -> Result<(), SyncError> {
		let data = match Resource::parse(id) {
			Resource::Journal => Some(serde_json::to_value(self.log.read_all().await?)?),
			Resource::Store(store) => Some(Value::Array(self.log.get_all(&store).await?)),
			Resource::Record { store, key } => self.log.get(&store, &key).await?,
		};

		self.send(
			requester,
			&Message::Response {
				from: self.pool.identity().clone(),
				to: requester.clone(),
				id: id.to_string(),
				data,
				operate: None,
			},
		)
	}

	/// A single already-resolved operation pushed by a peer; apply it
	/// without running a merge.
	async fn apply_propagated(
		&self,
		id: &str,
		operate: OperateKind,
		data: Option<Value>,
	) -> Result<(), SyncError> {
		let (store_name, key) = match Resource::parse(id) {
			Resource::Record { store, key } => (store, Some(key)),
			Resource::Store(store) => (store, None),
			Resource::Journal => (JOURNAL_STORE.to_string(), None),
		};

		self.log
			.apply_silently(&store_name, operate, key, data)
			.await?;
		trace!(store = %store_name, kind = %operate, "applied propagated operation");
		self.events.emit(SyncEvent::Applied { store_name });
		Ok(())
	}

	/// Diff the received journal against ours and converge: apply every
	/// winner silently, then overwrite our journal entry with it.
	async fn merge_remote_journal(
		&self,
		peer: &PeerIdentity,
		data: Option<Value>,
	) -> Result<(), SyncError> {
		let remote: Vec<OperationRecord> = match data {
			Some(value) => serde_json::from_value(value)?,
			None => Vec::new(),
		};
		let local = self.log.read_all().await?;
		let winners = merge_journals(&local, &remote);

		let mut applied = 0;
		let mut touched = BTreeSet::new();
		for record in winners {
			match self
				.log
				.apply_silently(
					&record.store_name,
					record.operate,
					record.key.clone(),
					record.data.clone(),
				)
				.await
			{
				Ok(()) => {
					applied += 1;
					touched.insert(record.store_name.clone());
				}
				// Record-scoped: skip it, keep going, no rollback.
				Err(err) => trace!(id = %record.id, %err, "store rejected merge operation"),
			}

			// The journal converges even when the store rejected the
			// mutation, otherwise the same id is re-fought every round. A
			// failed journal write is record-scoped too; the next round
			// selects the same winner again.
			if let Err(err) = self.log.overwrite(&record).await {
				warn!(id = %record.id, %err, "failed to overwrite journal entry");
			}
		}

		for store_name in touched {
			self.events.emit(SyncEvent::Applied { store_name });
		}
		debug!(%peer, applied, "merge round completed");
		self.events.emit(SyncEvent::RoundCompleted {
			peer: peer.clone(),
			applied,
		});
		Ok(())
	}

	fn send(&self, to: &PeerIdentity, message: &Message) -> Result<(), SyncError> {
		let bytes = serde_json::to_vec(message)?;
		self.pool.send(to, bytes)?;
		Ok(())
	}
}
