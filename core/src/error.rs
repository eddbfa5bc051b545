use thiserror::Error;

use crate::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("storage error: {0}")]
	Store(#[from] StoreError),
	#[error("send error: {0}")]
	Send(#[from] mb_p2p::SendError),
	#[error("malformed operation: {0}")]
	MalformedOperation(String),
}
