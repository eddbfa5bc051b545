use std::{cmp::Ordering, collections::HashMap};

use crate::{OpId, OperationRecord};

/// Diff two journals and select the records the local side must apply for
/// both sides to converge.
///
/// Selection rules, per id:
/// - present on one side only: selected (a record only we hold is still
///   selected so the journal entry is re-asserted verbatim; re-applying it
///   is harmless and keeps the result symmetric with the remote's own run);
/// - present on both sides with exactly one `Delete`: the `Delete` wins,
///   regardless of timestamps;
/// - present on both sides otherwise: the larger timestamp wins; identical
///   records select nothing, and equal timestamps over differing records
///   fall back to comparing the serialized forms so both directions still
///   pick the same winner.
///
/// Winners come back sorted ascending by timestamp (id as tie-break so the
/// order is deterministic). Running both directions of an exchange through
/// this function converges both journals and both target stores.
pub fn merge_journals(
	local: &[OperationRecord],
	remote: &[OperationRecord],
) -> Vec<OperationRecord> {
	// Duplicate ids within one journal should not occur; keep the last one
	// seen if they do.
	let local_by_id: HashMap<&OpId, &OperationRecord> =
		local.iter().map(|record| (&record.id, record)).collect();
	let remote_by_id: HashMap<&OpId, &OperationRecord> =
		remote.iter().map(|record| (&record.id, record)).collect();

	let mut winners = Vec::new();

	for (id, remote_record) in &remote_by_id {
		match local_by_id.get(*id) {
			None => winners.push((*remote_record).clone()),
			Some(local_record) => {
				if let Some(winner) = resolve(local_record, remote_record) {
					winners.push(winner.clone());
				}
			}
		}
	}

	for (id, local_record) in &local_by_id {
		if !remote_by_id.contains_key(*id) {
			winners.push((*local_record).clone());
		}
	}

	winners.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
	winners
}

fn resolve<'a>(
	local: &'a OperationRecord,
	remote: &'a OperationRecord,
) -> Option<&'a OperationRecord> {
	// Deletes are the be all and end all; a lone Delete beats any timestamp.
	if local.is_delete() != remote.is_delete() {
		return Some(if local.is_delete() { local } else { remote });
	}

	match remote.timestamp.cmp(&local.timestamp) {
		Ordering::Greater => Some(remote),
		Ordering::Less => Some(local),
		Ordering::Equal if local == remote => None,
		// Same millisecond, different records. Any deterministic pick that
		// both directions agree on will do; the serialized form is a total
		// order over records.
		Ordering::Equal => {
			let local_form = serde_json::to_string(local).unwrap_or_default();
			let remote_form = serde_json::to_string(remote).unwrap_or_default();
			Some(if local_form > remote_form {
				local
			} else {
				remote
			})
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::OperateKind;

	fn record(id: &str, timestamp: u64, operate: OperateKind) -> OperationRecord {
		OperationRecord {
			id: OpId::from(id.to_string()),
			timestamp,
			db_name: "app".to_string(),
			store_name: "todo".to_string(),
			operate,
			key: Some(id.to_string()),
			data: matches!(operate, OperateKind::Add | OperateKind::Put)
				.then(|| json!({ "id": id })),
		}
	}

	fn ids(winners: &[OperationRecord]) -> Vec<&str> {
		winners.iter().map(|r| r.id.as_str()).collect()
	}

	#[test]
	fn disjoint_sets_select_the_union() {
		let local = vec![
			record("a", 1, OperateKind::Add),
			record("b", 3, OperateKind::Put),
		];
		let remote = vec![
			record("c", 2, OperateKind::Add),
			record("d", 4, OperateKind::Delete),
		];

		let winners = merge_journals(&local, &remote);
		assert_eq!(ids(&winners), vec!["a", "c", "b", "d"]);
	}

	#[test]
	fn larger_timestamp_wins_for_shared_ids() {
		let local = vec![record("a", 5, OperateKind::Put)];
		let remote = vec![record("a", 9, OperateKind::Put)];

		let winners = merge_journals(&local, &remote);
		assert_eq!(winners.len(), 1);
		assert_eq!(winners[0].timestamp, 9);

		// Symmetric direction picks the same record.
		let winners = merge_journals(&remote, &local);
		assert_eq!(winners.len(), 1);
		assert_eq!(winners[0].timestamp, 9);
	}

	#[test]
	fn delete_override_beats_timestamp() {
		let local = vec![record("a", 20, OperateKind::Delete)];
		let remote = vec![record("a", 25, OperateKind::Put)];

		let winners = merge_journals(&local, &remote);
		assert_eq!(winners.len(), 1);
		assert!(winners[0].is_delete());
		assert_eq!(winners[0].timestamp, 20);

		let winners = merge_journals(&remote, &local);
		assert!(winners[0].is_delete());
	}

	#[test]
	fn two_deletes_fall_back_to_timestamps() {
		let local = vec![record("a", 20, OperateKind::Delete)];
		let remote = vec![record("a", 25, OperateKind::Delete)];

		let winners = merge_journals(&local, &remote);
		assert_eq!(winners[0].timestamp, 25);
	}

	#[test]
	fn equal_timestamps_with_differing_records_still_pick_one_side() {
		let mut local = record("a", 10, OperateKind::Put);
		local.data = Some(json!({ "id": "a", "text": "local version" }));
		let mut remote = record("a", 10, OperateKind::Put);
		remote.data = Some(json!({ "id": "a", "text": "remote version" }));

		let forward = merge_journals(&[local.clone()], &[remote.clone()]);
		let backward = merge_journals(&[remote], &[local]);

		// One winner, and the same one from both directions.
		assert_eq!(forward.len(), 1);
		assert_eq!(forward, backward);
	}

	#[test]
	fn identical_journals_select_nothing() {
		let journal = vec![
			record("a", 1, OperateKind::Add),
			record("b", 2, OperateKind::Put),
		];

		assert!(merge_journals(&journal, &journal).is_empty());
	}

	#[test]
	fn winners_are_sorted_by_timestamp() {
		let local = vec![record("z", 30, OperateKind::Add)];
		let remote = vec![
			record("m", 20, OperateKind::Add),
			record("a", 10, OperateKind::Add),
		];

		let winners = merge_journals(&local, &remote);
		let timestamps: Vec<_> = winners.iter().map(|r| r.timestamp).collect();
		assert_eq!(timestamps, vec![10, 20, 30]);
	}

	#[test]
	fn duplicate_ids_within_one_journal_keep_the_last() {
		let mut older = record("a", 1, OperateKind::Add);
		older.data = Some(json!({ "id": "a", "text": "old" }));
		let mut newer = record("a", 1, OperateKind::Add);
		newer.data = Some(json!({ "id": "a", "text": "new" }));

		let winners = merge_journals(&[], &[older, newer]);
		assert_eq!(winners.len(), 1);
		assert_eq!(winners[0].data.as_ref().unwrap()["text"], "new");
	}
}
