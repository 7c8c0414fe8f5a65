//! Change-set computation and replay

use std::collections::{HashMap, HashSet};

use crate::backup::types::{ChangeSet, CollectionChanges};
use crate::records::{Dataset, Record};

/// Compute what changed from `previous` to `current`, per collection and
/// keyed by record id. Records are compared structurally.
pub fn compute_changes(current: &Dataset, previous: &Dataset) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (name, records) in current.iter() {
        let before = match previous.collection(name) {
            Some(before) => before,
            None => {
                changes.created_collections.insert(name.to_string());
                &[]
            }
        };

        let diff = diff_collection(records, before);
        if !diff.is_empty() {
            changes.collections.insert(name.to_string(), diff);
        }
    }

    for (name, records) in previous.iter() {
        if current.collection(name).is_some() {
            continue;
        }
        changes.dropped_collections.insert(name.to_string());
        if !records.is_empty() {
            changes.collections.insert(
                name.to_string(),
                CollectionChanges {
                    deleted: records.to_vec(),
                    ..CollectionChanges::default()
                },
            );
        }
    }

    changes
}

fn diff_collection(current: &[Record], previous: &[Record]) -> CollectionChanges {
    let before: HashMap<&str, &Record> = previous.iter().map(|r| (r.id.as_str(), r)).collect();
    let now_ids: HashSet<&str> = current.iter().map(|r| r.id.as_str()).collect();

    let mut diff = CollectionChanges::default();
    for record in current {
        match before.get(record.id.as_str()) {
            None => diff.added.push(record.clone()),
            Some(old) if *old != record => diff.modified.push(record.clone()),
            Some(_) => {}
        }
    }
    diff.deleted = previous
        .iter()
        .filter(|r| !now_ids.contains(r.id.as_str()))
        .cloned()
        .collect();

    // Replay keeps surviving records in place and appends new ones
    let replayed = previous
        .iter()
        .filter(|r| now_ids.contains(r.id.as_str()))
        .chain(diff.added.iter())
        .map(|r| r.id.as_str());
    if !replayed.eq(current.iter().map(|r| r.id.as_str())) {
        diff.order = Some(current.iter().map(|r| r.id.clone()).collect());
    }
    diff
}

/// Replay a change-set on top of `base`.
///
/// Existing records keep their position, modified records are replaced in
/// place and added records are appended. A recorded `order` then restores
/// the exact sequence of the dataset the change-set was computed from.
pub fn apply_changes(base: &mut Dataset, changes: &ChangeSet) {
    for name in &changes.created_collections {
        if base.collection(name).is_none() {
            base.insert_collection(name.clone(), Vec::new());
        }
    }

    for (name, diff) in &changes.collections {
        if base.collection(name).is_none() {
            base.insert_collection(name.clone(), Vec::new());
        }
        let Some(records) = base.collection_mut(name) else {
            continue;
        };

        let deleted: HashSet<&str> = diff.deleted.iter().map(|r| r.id.as_str()).collect();
        records.retain(|r| !deleted.contains(r.id.as_str()));

        for record in diff.modified.iter().chain(diff.added.iter()) {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        }

        if let Some(order) = &diff.order {
            let position: HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            records.sort_by_key(|r| position.get(r.id.as_str()).copied().unwrap_or(usize::MAX));
        }
    }

    if !changes.dropped_collections.is_empty() {
        let kept: Vec<(String, Vec<Record>)> = base
            .iter()
            .filter(|(name, _)| !changes.dropped_collections.contains(*name))
            .map(|(name, records)| (name.to_string(), records.to_vec()))
            .collect();
        *base = kept.into_iter().collect();
    }
}
