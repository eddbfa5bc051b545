use mb_p2p::PeerIdentity;
use mb_sync::OperateKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JOURNAL_STORE;

/// Wire messages exchanged between peers. JSON on the wire; framing is the
/// transport's problem.
///
/// The `id` names a resource: `"operates"` is the journal, `"<store>"` a
/// full store scan, `"<store>/<key>"` a point lookup.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum Message {
	/// "Send me everything you have for the resource named `id`."
	#[serde(rename = "REQUEST")]
	Request {
		from: PeerIdentity,
		to: PeerIdentity,
		id: String,
	},
	/// The requested payload, or a single already-resolved operation being
	/// propagated point-to-point when `operate` is set.
	#[serde(rename = "RESPONSE")]
	Response {
		from: PeerIdentity,
		to: PeerIdentity,
		id: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		data: Option<Value>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		operate: Option<OperateKind>,
	},
}

/// Parsed form of a resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
	Journal,
	Store(String),
	Record { store: String, key: String },
}

impl Resource {
	pub fn parse(id: &str) -> Self {
		if id == JOURNAL_STORE {
			return Self::Journal;
		}
		match id.split_once('/') {
			Some((store, key)) => Self::Record {
				store: store.to_string(),
				key: key.to_string(),
			},
			None => Self::Store(id.to_string()),
		}
	}

	pub fn record(store: &str, key: &str) -> String {
		format!("{store}/{key}")
	}
}
