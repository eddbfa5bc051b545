use std::{
	fmt::{self, Debug, Display},
	time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch, read from the device wall clock.
///
/// Journal timestamps carry no more than this. Merge correctness only needs
/// timestamps to be comparable across devices, not monotonic.
#[allow(clippy::missing_panics_doc)] // the epoch is always in the past
pub fn now_ms() -> u64 {
	#[allow(clippy::cast_possible_truncation)]
	{
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.expect("system clock before Unix epoch")
			.as_millis() as u64
	}
}

/// Unique identifier of a journal entry.
///
/// Built from the local clock plus 64 bits of entropy, so uniqueness across
/// peers is probabilistic rather than guaranteed. No peer ever assigns ids to
/// another, which keeps collisions astronomically unlikely at the scale this
/// system targets.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(String);

impl OpId {
	pub fn generate(timestamp_ms: u64) -> Self {
		let entropy: u64 = rand::random();
		Self(format!("{timestamp_ms:x}-{entropy:016x}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<String> for OpId {
	fn from(raw: String) -> Self {
		Self(raw)
	}
}

impl Display for OpId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl Debug for OpId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "OpId({})", self.0)
	}
}

/// The kind of mutation a journal entry describes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperateKind {
	/// Insert a record; fails if the key is already present.
	Add,
	/// Insert or replace a record.
	Put,
	/// Remove a record by key. Removing an absent key is a no-op.
	Delete,
	/// Remove every record in the target store.
	Clear,
}

impl Display for OperateKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Add => "add",
			Self::Put => "put",
			Self::Delete => "delete",
			Self::Clear => "clear",
		})
	}
}

/// One entry of the append-only operation journal, the unit of replication.
///
/// Records are immutable once written; the only exception is being replaced
/// wholesale by a merge winner with the same id during convergence.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
	pub id: OpId,
	/// Device wall clock at append time, in milliseconds.
	pub timestamp: u64,
	pub db_name: String,
	pub store_name: String,
	#[serde(rename = "operateType")]
	pub operate: OperateKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl OperationRecord {
	/// Stamp a fresh record with a new id and the current wall clock.
	pub fn new(
		db_name: impl Into<String>,
		store_name: impl Into<String>,
		operate: OperateKind,
		key: Option<String>,
		data: Option<Value>,
	) -> Self {
		let timestamp = now_ms();
		Self {
			id: OpId::generate(timestamp),
			timestamp,
			db_name: db_name.into(),
			store_name: store_name.into(),
			operate,
			key,
			data,
		}
	}

	pub fn is_delete(&self) -> bool {
		self.operate == OperateKind::Delete
	}
}

impl Debug for OperationRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("OperationRecord")
			.field("id", &self.id)
			.field("timestamp", &self.timestamp)
			.field("store_name", &self.store_name)
			.field("operate", &self.operate)
			.field("key", &self.key)
			.finish()
	}
}
