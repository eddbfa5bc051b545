//! Typed publish/subscribe bus.
//!
//! Producers emit events, subscribers receive them over a [`flume`] channel.
//! Dispatch is synchronous and in subscription order; a subscriber that has
//! gone away is pruned and never prevents delivery to the remaining ones.
//! Unsubscribing is simply dropping the receiver.

use std::sync::{Mutex, PoisonError};

use tracing::trace;

#[derive(Debug)]
pub struct EventBus<E> {
	subscribers: Mutex<Vec<flume::Sender<E>>>,
}

impl<E> Default for EventBus<E> {
	fn default() -> Self {
		Self {
			subscribers: Mutex::new(Vec::new()),
		}
	}
}

impl<E: Clone> EventBus<E> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a new subscriber. Events emitted after this call will be
	/// delivered to the returned receiver until it is dropped.
	pub fn subscribe(&self) -> flume::Receiver<E> {
		let (tx, rx) = flume::unbounded();
		self.subscribers
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(tx);
		rx
	}

	/// Deliver `event` to every live subscriber, in subscription order.
	/// Subscribers whose receiving end was dropped are removed here.
	pub fn emit(&self, event: E) {
		let mut subscribers = self
			.subscribers
			.lock()
			.unwrap_or_else(PoisonError::into_inner);

		let before = subscribers.len();
		subscribers.retain(|tx| tx.send(event.clone()).is_ok());
		if subscribers.len() != before {
			trace!(
				pruned = before - subscribers.len(),
				"removed dead event subscribers"
			);
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}
}
