//! Meshbase core: the operation log and the journal diff/merge sync engine.
//!
//! Local mutations go through [`OperationLog::append`], which journals them
//! and mutates the target store in one atomic batch. When the peer pool
//! reports a new connection, the [`SyncEngine`] pulls the peer's journal,
//! diffs it against ours and applies the winning records silently so the
//! merge never re-journals what it pulls in.

#![warn(
	clippy::all,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms
)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod engine;
mod error;
mod log;
mod protocol;
mod store;

pub use engine::{SyncEngine, SyncEvent};
pub use error::SyncError;
pub use log::{OperationLog, JOURNAL_STORE};
pub use protocol::{Message, Resource};
pub use store::{MemoryStore, Store, StoreError, WriteOp};

pub use mb_event_bus::EventBus;
pub use mb_sync::{merge_journals, now_ms, OpId, OperateKind, OperationRecord};
