use std::sync::Arc;

use mb_sync::{now_ms, OpId, OperateKind, OperationRecord};
use serde_json::Value;
use tracing::trace;

use crate::{Store, SyncError, WriteOp};

/// Name of the store holding the journal itself. The journal is never
/// cleared by normal operation; a `Clear` record targets its own store.
pub const JOURNAL_STORE: &str = "operates";

/// Append/overwrite-only journal over the storage capability. Every tracked
/// mutation flows through here; the journal rows are what peers exchange.
///
/// The journal holds one row per logical record: the first mutation of a
/// `(store, key)` mints the unique id, and later mutations of the same key
/// overwrite that row keeping the id. That shared id is what lets two peers'
/// competing ops for the same record meet in the merge, where the
/// delete-override rule can arbitrate them.
pub struct OperationLog {
	db_name: String,
	store: Arc<dyn Store>,
}

impl OperationLog {
	pub fn new(db_name: impl Into<String>, store: Arc<dyn Store>) -> Self {
		Self {
			db_name: db_name.into(),
			store,
		}
	}

	pub fn db_name(&self) -> &str {
		&self.db_name
	}

	/// Journal a mutation and perform it, as one atomic batch: either the
	/// record and its effect both land or neither does.
	pub async fn append(
		&self,
		store_name: &str,
		operate: OperateKind,
		key: Option<String>,
		data: Option<Value>,
	) -> Result<OperationRecord, SyncError> {
		let key = normalize_key(store_name, operate, key, data.as_ref())?;
		let timestamp = now_ms();
		let id = self
			.journal_id_for(store_name, key.as_deref())
			.await?
			.unwrap_or_else(|| OpId::generate(timestamp));

		let record = OperationRecord {
			id,
			timestamp,
			db_name: self.db_name.clone(),
			store_name: store_name.to_string(),
			operate,
			key,
			data,
		};

		self.store
			.apply(vec![journal_write(&record)?, target_write(&record)?])
			.await?;

		trace!(id = %record.id, store = store_name, kind = %operate, "journaled mutation");
		Ok(record)
	}

	/// The id of the journal row already tracking this logical record, if
	/// one exists.
	async fn journal_id_for(
		&self,
		store_name: &str,
		key: Option<&str>,
	) -> Result<Option<OpId>, SyncError> {
		Ok(self
			.read_all()
			.await?
			.into_iter()
			.find(|row| row.store_name == store_name && row.key.as_deref() == key)
			.map(|row| row.id))
	}

	/// Perform a mutation without journaling it. Exclusively for applying
	/// remote-derived operations, so merge application never generates new
	/// journal entries that would be synced right back out.
	pub async fn apply_silently(
		&self,
		store_name: &str,
		operate: OperateKind,
		key: Option<String>,
		data: Option<Value>,
	) -> Result<(), SyncError> {
		let write = mutation_write(store_name, operate, key, data)?;
		self.store.apply(vec![write]).await?;
		Ok(())
	}

	/// The full journal. Order is irrelevant; the merge sorts on its own.
	pub async fn read_all(&self) -> Result<Vec<OperationRecord>, SyncError> {
		self.store
			.get_all(JOURNAL_STORE)
			.await?
			.into_iter()
			.map(|row| serde_json::from_value(row).map_err(Into::into))
			.collect()
	}

	/// Replace (or insert) the journal entry at `record.id` verbatim. Used
	/// after a merge so both peers' journals converge on the same winners.
	pub async fn overwrite(&self, record: &OperationRecord) -> Result<(), SyncError> {
		self.store.apply(vec![journal_write(record)?]).await?;
		Ok(())
	}

	/// Point lookup on a target store.
	pub async fn get(&self, store_name: &str, key: &str) -> Result<Option<Value>, SyncError> {
		Ok(self.store.get(store_name, key).await?)
	}

	/// Full scan of a target store.
	pub async fn get_all(&self, store_name: &str) -> Result<Vec<Value>, SyncError> {
		Ok(self.store.get_all(store_name).await?)
	}
}

/// Resolve the key a mutation addresses before journaling, so journal rows
/// can be matched by `(store, key)`. `Add`/`Put` may derive it from the
/// value's `"id"` field; `Clear` addresses the whole store and has none.
fn normalize_key(
	store_name: &str,
	operate: OperateKind,
	key: Option<String>,
	data: Option<&Value>,
) -> Result<Option<String>, SyncError> {
	match operate {
		OperateKind::Clear => Ok(None),
		OperateKind::Delete => Ok(Some(
			key.ok_or_else(|| missing("delete", store_name, "key"))?,
		)),
		OperateKind::Add | OperateKind::Put => {
			if key.is_some() {
				return Ok(key);
			}
			match data.and_then(|value| value.get("id")) {
				Some(Value::String(id)) => Ok(Some(id.clone())),
				Some(Value::Number(id)) => Ok(Some(id.to_string())),
				_ => Err(missing(
					if operate == OperateKind::Add { "add" } else { "put" },
					store_name,
					"key",
				)),
			}
		}
	}
}

fn journal_write(record: &OperationRecord) -> Result<WriteOp, SyncError> {
	Ok(WriteOp::Put {
		store: JOURNAL_STORE.to_string(),
		key: Some(record.id.to_string()),
		value: serde_json::to_value(record)?,
	})
}

fn target_write(record: &OperationRecord) -> Result<WriteOp, SyncError> {
	mutation_write(
		&record.store_name,
		record.operate,
		record.key.clone(),
		record.data.clone(),
	)
}

fn mutation_write(
	store_name: &str,
	operate: OperateKind,
	key: Option<String>,
	data: Option<Value>,
) -> Result<WriteOp, SyncError> {
	let store = store_name.to_string();
	Ok(match operate {
		OperateKind::Add => WriteOp::Add {
			store,
			key,
			value: data.ok_or_else(|| missing("add", store_name, "data"))?,
		},
		OperateKind::Put => WriteOp::Put {
			store,
			key,
			value: data.ok_or_else(|| missing("put", store_name, "data"))?,
		},
		OperateKind::Delete => WriteOp::Delete {
			store,
			key: key.ok_or_else(|| missing("delete", store_name, "key"))?,
		},
		OperateKind::Clear => WriteOp::Clear { store },
	})
}

fn missing(kind: &str, store_name: &str, what: &str) -> SyncError {
	SyncError::MalformedOperation(format!("{kind} on {store_name:?} is missing its {what}"))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::MemoryStore;

	fn log() -> OperationLog {
		OperationLog::new("app", Arc::new(MemoryStore::new()))
	}

	#[tokio::test]
	async fn append_journals_and_mutates() {
		let log = log();

		let record = log
			.append(
				"todo",
				OperateKind::Add,
				None,
				Some(json!({ "id": "t1", "text": "milk" })),
			)
			.await
			.unwrap();

		assert_eq!(log.get("todo", "t1").await.unwrap().unwrap()["text"], "milk");

		let journal = log.read_all().await.unwrap();
		assert_eq!(journal.len(), 1);
		assert_eq!(journal[0], record);
	}

	#[tokio::test]
	async fn failed_append_journals_nothing() {
		let log = log();
		log.append("todo", OperateKind::Add, None, Some(json!({ "id": "t1" })))
			.await
			.unwrap();

		// Adding the same key again fails; the journal must not grow.
		let result = log
			.append("todo", OperateKind::Add, None, Some(json!({ "id": "t1" })))
			.await;
		assert!(result.is_err());
		assert_eq!(log.read_all().await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn mutating_the_same_key_reuses_the_journal_row() {
		let log = log();

		let added = log
			.append(
				"todo",
				OperateKind::Add,
				None,
				Some(json!({ "id": "t1", "text": "milk" })),
			)
			.await
			.unwrap();
		let deleted = log
			.append("todo", OperateKind::Delete, Some("t1".to_string()), None)
			.await
			.unwrap();

		assert_eq!(added.id, deleted.id);
		assert!(deleted.timestamp >= added.timestamp);

		let journal = log.read_all().await.unwrap();
		assert_eq!(journal.len(), 1);
		assert!(journal[0].is_delete());
		assert!(log.get("todo", "t1").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn distinct_keys_get_distinct_rows() {
		let log = log();

		log.append("todo", OperateKind::Add, None, Some(json!({ "id": "t1" })))
			.await
			.unwrap();
		log.append("todo", OperateKind::Add, None, Some(json!({ "id": "t2" })))
			.await
			.unwrap();

		let journal = log.read_all().await.unwrap();
		assert_eq!(journal.len(), 2);
		assert_ne!(journal[0].id, journal[1].id);
	}

	#[tokio::test]
	async fn silent_apply_does_not_journal() {
		let log = log();

		log.apply_silently(
			"todo",
			OperateKind::Put,
			Some("t1".to_string()),
			Some(json!({ "id": "t1" })),
		)
		.await
		.unwrap();

		assert!(log.get("todo", "t1").await.unwrap().is_some());
		assert!(log.read_all().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn overwrite_upserts_by_id() {
		let log = log();
		let mut record = log
			.append("todo", OperateKind::Add, None, Some(json!({ "id": "t1" })))
			.await
			.unwrap();

		record.operate = OperateKind::Delete;
		record.data = None;
		record.key = Some("t1".to_string());
		log.overwrite(&record).await.unwrap();

		let journal = log.read_all().await.unwrap();
		assert_eq!(journal.len(), 1);
		assert!(journal[0].is_delete());
	}

	#[tokio::test]
	async fn malformed_operations_are_rejected() {
		let log = log();

		assert!(log
			.append("todo", OperateKind::Delete, None, None)
			.await
			.is_err());
		assert!(log.append("todo", OperateKind::Put, None, None).await.is_err());
	}
}
