//! Snapshot differ: classifies every identifier of `old ∪ new` exactly once.
//!
//! Records are keyed by their provider-local id. When a snapshot carries the same id more
//! than once, the last occurrence in feed order wins. Records with an empty id cannot be
//! keyed and are reported as malformed instead of being diffed.
//!
//! Namespacing can fold two local ids onto one global id (`5` and an already prefixed
//! `TM_5`). Only one of them survives; the other is reported as malformed so that no global
//! id ever carries two classifications.

use std::collections::BTreeMap;

use remap_core::{DeltaEntry, DeltaKind, DeltaSummary, EventRecord, MalformedRecord, ProviderTag, Snapshot};
use serde::Serialize;

/// One classified identifier together with the record the reconciler acts on: the new
/// record for added/changed/unchanged entries, the old one for removals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaChange {
    pub entry: DeltaEntry,
    /// Identifier as the provider published it, before namespacing.
    pub local_id: String,
    /// Position in the snapshot the record came from (the old one for removals).
    pub position: usize,
    pub record: EventRecord,
}

impl DeltaChange {
    pub fn kind(&self) -> DeltaKind {
        self.entry.kind
    }

    pub fn needs_upsert(&self) -> bool {
        matches!(self.entry.kind, DeltaKind::Added | DeltaKind::Changed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Delta {
    pub changes: Vec<DeltaChange>,
    pub malformed: Vec<MalformedRecord>,
}

impl Delta {
    /// Counts are always derived from the classified entries themselves.
    pub fn summary(&self) -> DeltaSummary {
        DeltaSummary::from_entries(self.entries(), self.malformed.len())
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.changes.iter().map(|c| &c.entry)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether applying this delta would touch the index at all.
    pub fn has_mutations(&self) -> bool {
        self.changes.iter().any(|c| c.entry.kind != DeltaKind::Unchanged)
    }

    /// Rewrite every identifier into the provider's global namespace.
    ///
    /// When two entries land on the same global id, an entry still present in the new
    /// snapshot beats a removal, then the bare local id beats the prefixed one. The loser
    /// moves to `malformed`.
    pub fn namespaced(self, tag: &ProviderTag) -> Self {
        let Delta { changes, mut malformed } = self;
        let mut by_global: BTreeMap<String, DeltaChange> = BTreeMap::new();

        for mut change in changes {
            let global = tag.namespace(&change.entry.id);
            change.record.id = global.clone();
            change.entry.id = global.clone();

            let Some(held) = by_global.remove(&global) else {
                by_global.insert(global, change);
                continue;
            };
            let (kept, dropped) = if outranks(&change, &held, tag) {
                (change, held)
            } else {
                (held, change)
            };
            malformed.push(MalformedRecord {
                position: dropped.position,
                id: Some(dropped.local_id.clone()),
                reason: format!(
                    "namespaced id {global} collides with local id {:?} ({})",
                    kept.local_id,
                    kept.kind().as_str()
                ),
            });
            by_global.insert(global, kept);
        }

        Delta {
            changes: by_global.into_values().collect(),
            malformed,
        }
    }
}

fn outranks(candidate: &DeltaChange, held: &DeltaChange, tag: &ProviderTag) -> bool {
    let live = |c: &DeltaChange| c.kind() != DeltaKind::Removed;
    match (live(candidate), live(held)) {
        (true, false) => true,
        (false, true) => false,
        _ => !tag.is_namespaced(&candidate.local_id),
    }
}

fn fingerprint_of(record: &EventRecord) -> String {
    if record.fingerprint.is_empty() {
        record.compute_fingerprint()
    } else {
        record.fingerprint.clone()
    }
}

fn keyed<'a>(
    side: &str,
    records: &'a [EventRecord],
    malformed: &mut Vec<MalformedRecord>,
) -> BTreeMap<String, (usize, &'a EventRecord)> {
    let mut map = BTreeMap::new();
    for (position, record) in records.iter().enumerate() {
        let id = record.id.trim();
        if id.is_empty() {
            malformed.push(MalformedRecord {
                position,
                id: None,
                reason: format!("{side} snapshot record without identifier"),
            });
            continue;
        }
        map.insert(id.to_string(), (position, record));
    }
    map
}

/// Classify `old` against `new`. Output is ordered by identifier.
pub fn compute_delta(old: &[EventRecord], new: &[EventRecord]) -> Delta {
    let mut malformed = Vec::new();
    let old_map = keyed("old", old, &mut malformed);
    let new_map = keyed("new", new, &mut malformed);

    let mut changes = Vec::with_capacity(old_map.len().max(new_map.len()));
    for (id, &(position, record)) in &new_map {
        let new_fp = fingerprint_of(record);
        let (kind, old_fp) = match old_map.get(id) {
            None => (DeltaKind::Added, None),
            Some(&(_, previous)) => {
                let old_fp = fingerprint_of(previous);
                let kind = if old_fp == new_fp {
                    DeltaKind::Unchanged
                } else {
                    DeltaKind::Changed
                };
                (kind, Some(old_fp))
            }
        };
        changes.push(DeltaChange {
            entry: DeltaEntry {
                id: id.clone(),
                kind,
                old_fingerprint: old_fp,
                new_fingerprint: Some(new_fp),
            },
            local_id: id.clone(),
            position,
            record: EventRecord {
                id: id.clone(),
                ..record.clone()
            },
        });
    }
    for (id, &(position, record)) in &old_map {
        if new_map.contains_key(id) {
            continue;
        }
        changes.push(DeltaChange {
            entry: DeltaEntry {
                id: id.clone(),
                kind: DeltaKind::Removed,
                old_fingerprint: Some(fingerprint_of(record)),
                new_fingerprint: None,
            },
            local_id: id.clone(),
            position,
            record: EventRecord {
                id: id.clone(),
                ..record.clone()
            },
        });
    }
    changes.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));

    Delta { changes, malformed }
}

pub fn compute_snapshot_delta(old: &Snapshot, new: &Snapshot) -> Delta {
    compute_delta(&old.records, &new.records)
}
