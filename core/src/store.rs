use std::{
	collections::{BTreeMap, HashMap},
	sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
	#[error("key {key:?} already exists in store {store:?}")]
	KeyExists { store: String, key: String },
	#[error("record for store {0:?} has no usable key")]
	MissingKey(String),
	#[error("storage backend error: {0}")]
	Backend(String),
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
	/// Insert; rejects an existing key. A missing key is derived from the
	/// value's `"id"` field, the usual key-path convention.
	Add {
		store: String,
		key: Option<String>,
		value: Value,
	},
	/// Insert or replace.
	Put {
		store: String,
		key: Option<String>,
		value: Value,
	},
	/// Remove by key; removing an absent key is a no-op.
	Delete { store: String, key: String },
	/// Remove everything in the store.
	Clear { store: String },
}

/// The durable key/value storage capability.
///
/// `apply` is the only write surface and is all-or-nothing: either every
/// write in the batch lands or none does. That is what lets the operation
/// log journal a mutation and perform it as one unit.
#[async_trait]
pub trait Store: Send + Sync + 'static {
	async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError>;
	async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError>;
	async fn apply(&self, writes: Vec<WriteOp>) -> Result<(), StoreError>;
}

type Stores = HashMap<String, BTreeMap<String, Value>>;

/// In-memory [`Store`]: a map of named stores, each ordered by key.
#[derive(Debug, Default)]
pub struct MemoryStore {
	stores: Mutex<Stores>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
		let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
		Ok(stores.get(store).and_then(|s| s.get(key)).cloned())
	}

	async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError> {
		let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
		Ok(stores
			.get(store)
			.map(|s| s.values().cloned().collect())
			.unwrap_or_default())
	}

	async fn apply(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
		let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);

		// Stage on a copy so a failing write leaves nothing behind.
		let mut staged = stores.clone();
		for write in writes {
			apply_one(&mut staged, write)?;
		}
		*stores = staged;

		Ok(())
	}
}

fn apply_one(stores: &mut Stores, write: WriteOp) -> Result<(), StoreError> {
	match write {
		WriteOp::Add { store, key, value } => {
			let key = resolve_key(&store, key, &value)?;
			let records = stores.entry(store.clone()).or_default();
			if records.contains_key(&key) {
				return Err(StoreError::KeyExists { store, key });
			}
			records.insert(key, value);
		}
		WriteOp::Put { store, key, value } => {
			let key = resolve_key(&store, key, &value)?;
			stores.entry(store).or_default().insert(key, value);
		}
		WriteOp::Delete { store, key } => {
			if let Some(records) = stores.get_mut(&store) {
				records.remove(&key);
			}
		}
		WriteOp::Clear { store } => {
			if let Some(records) = stores.get_mut(&store) {
				records.clear();
			}
		}
	}

	Ok(())
}

fn resolve_key(store: &str, key: Option<String>, value: &Value) -> Result<String, StoreError> {
	if let Some(key) = key {
		return Ok(key);
	}

	match value.get("id") {
		Some(Value::String(id)) => Ok(id.clone()),
		Some(Value::Number(id)) => Ok(id.to_string()),
		_ => Err(StoreError::MissingKey(store.to_string())),
	}
}
