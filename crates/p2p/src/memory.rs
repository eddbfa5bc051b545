use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError,
	},
};

use async_trait::async_trait;

use crate::{
	Endpoint, Link, LinkDirection, LinkEvent, PeerIdentity, RegisterError, Transport,
	TransportError,
};

type SharedSlots = Arc<Mutex<HashMap<PeerIdentity, Slot>>>;
type LinkSinks = Arc<Mutex<Vec<flume::Sender<LinkEvent>>>>;

/// In-process transport: the shared namespace is a map from identity to the
/// claiming endpoint's mailbox. Useful for tests and for running several
/// peers inside one process.
///
/// A slot counts as claimed while its mailbox is alive; dropping or closing
/// the endpoint releases the name, which is exactly the "release by
/// disconnecting" contract of the namespace.
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
	slots: SharedSlots,
}

#[derive(Debug)]
struct Slot {
	mailbox: flume::Sender<Link>,
	/// Event senders of every link half terminating at this endpoint, so
	/// closing the endpoint can signal `Closed` to all of them.
	sinks: LinkSinks,
}

impl MemoryTransport {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Transport for MemoryTransport {
	async fn register(&self, identity: &PeerIdentity) -> Result<Box<dyn Endpoint>, RegisterError> {
		let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

		if let Some(slot) = slots.get(identity) {
			if !slot.mailbox.is_disconnected() {
				return Err(RegisterError::NameUnavailable);
			}
		}

		let (mailbox, incoming) = flume::unbounded();
		let sinks = LinkSinks::default();
		slots.insert(
			identity.clone(),
			Slot {
				mailbox,
				sinks: sinks.clone(),
			},
		);

		Ok(Box::new(MemoryEndpoint {
			identity: identity.clone(),
			incoming,
			slots: self.slots.clone(),
			sinks,
			closed: AtomicBool::new(false),
		}))
	}
}

#[derive(Debug)]
struct MemoryEndpoint {
	identity: PeerIdentity,
	incoming: flume::Receiver<Link>,
	slots: SharedSlots,
	sinks: LinkSinks,
	closed: AtomicBool,
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
	fn identity(&self) -> &PeerIdentity {
		&self.identity
	}

	async fn dial(&self, to: &PeerIdentity) -> Result<Link, TransportError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(TransportError::ChannelClosed);
		}

		let (remote_mailbox, remote_sinks) = {
			let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
			let slot = slots
				.get(to)
				.filter(|slot| !slot.mailbox.is_disconnected())
				.ok_or_else(|| TransportError::Unreachable(to.clone()))?;
			(slot.mailbox.clone(), slot.sinks.clone())
		};

		let (our_events_tx, our_events_rx) = flume::unbounded();
		let (their_events_tx, their_events_rx) = flume::unbounded();
		let (our_out_tx, our_out_rx) = flume::unbounded();
		let (their_out_tx, their_out_rx) = flume::unbounded();

		// Each pump forwards one side's frames into the other side's event
		// stream and signals `Closed` when its sender is dropped.
		tokio::spawn(pump(our_out_rx, their_events_tx.clone()));
		tokio::spawn(pump(their_out_rx, our_events_tx.clone()));

		let _ = our_events_tx.send(LinkEvent::Open);
		let _ = their_events_tx.send(LinkEvent::Open);

		remote_mailbox
			.send(Link {
				remote: self.identity.clone(),
				direction: LinkDirection::Inbound,
				outgoing: their_out_tx,
				events: their_events_rx,
			})
			.map_err(|_| TransportError::Unreachable(to.clone()))?;

		track(&self.sinks, our_events_tx);
		track(&remote_sinks, their_events_tx);

		Ok(Link {
			remote: to.clone(),
			direction: LinkDirection::Outbound,
			outgoing: our_out_tx,
			events: our_events_rx,
		})
	}

	async fn accept(&self) -> Option<Link> {
		if self.closed.load(Ordering::Acquire) {
			return None;
		}
		self.incoming.recv_async().await.ok()
	}

	async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		// Releasing the slot drops the mailbox, which both frees the name
		// for a successor and wakes any pending `accept`.
		self.slots
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.identity);

		let sinks = {
			let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
			std::mem::take(&mut *sinks)
		};
		for sink in sinks {
			let _ = sink.send(LinkEvent::Closed);
		}
	}
}

async fn pump(frames: flume::Receiver<Vec<u8>>, events: flume::Sender<LinkEvent>) {
	while let Ok(bytes) = frames.recv_async().await {
		if events.send(LinkEvent::Data(bytes)).is_err() {
			return;
		}
	}
	let _ = events.send(LinkEvent::Closed);
}

fn track(sinks: &LinkSinks, sink: flume::Sender<LinkEvent>) {
	let mut sinks = sinks.lock().unwrap_or_else(PoisonError::into_inner);
	sinks.retain(|tx| !tx.is_disconnected());
	sinks.push(sink);
}
