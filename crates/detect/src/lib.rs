//! rollwatch change detector.
//!
//! Compares two snapshots of one identity and reports, per sub-entity name,
//! the tracked fields whose values differ. Sub-entities are correlated by
//! name, never by their position in the array, so reordering containers
//! between revisions produces no spurious records.

#![forbid(unsafe_code)]

use rollwatch_core::{
    MalformedEntry, MalformedSnapshotError, ResourceFieldChange, ResourceIdentity, ResourceSnapshot, SemanticChangeRecord,
    StructuralChange, SubEntity,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Which side of an update a malformed entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Old,
    New,
}

/// Everything one UPDATE produced. Complete when returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub records: Vec<SemanticChangeRecord>,
    /// Resource-level field changes, such as a pod phase transition.
    pub resource: Vec<ResourceFieldChange>,
    pub structural: Vec<StructuralChange>,
    pub malformed: Vec<(Side, MalformedSnapshotError)>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.resource.is_empty() && self.structural.is_empty() && self.malformed.is_empty()
    }

    pub fn summary(&self) -> DetectionSummary {
        let mut s = DetectionSummary {
            changed_fields: self.records.len(),
            resource_fields: self.resource.len(),
            ..Default::default()
        };
        for c in &self.structural {
            match c {
                StructuralChange::Added(_) => s.added += 1,
                StructuralChange::Removed(_) => s.removed += 1,
            }
        }
        s.malformed = self.malformed.len();
        s
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub changed_fields: usize,
    pub resource_fields: usize,
    pub added: usize,
    pub removed: usize,
    pub malformed: usize,
}

fn by_name(snap: &ResourceSnapshot) -> FxHashMap<&str, &SubEntity> {
    snap.sub_entities.iter().map(|s| (s.name.as_str(), s)).collect()
}

fn malformed_errors<'a>(
    identity: &'a ResourceIdentity,
    side: Side,
    entries: &'a [MalformedEntry],
) -> impl Iterator<Item = (Side, MalformedSnapshotError)> + 'a {
    entries.iter().map(move |e| {
        (side, MalformedSnapshotError { identity: Some(identity.clone()), index: e.index, reason: e.reason.clone() })
    })
}

/// Diff `old` against `new` over `tracked_fields`.
///
/// Records are sorted by sub-entity name then field, but callers must not
/// rely on any order.
pub fn detect(
    identity: &ResourceIdentity,
    old: &ResourceSnapshot,
    new: &ResourceSnapshot,
    tracked_fields: &[String],
) -> Detection {
    let mut out = Detection::default();
    out.malformed.extend(malformed_errors(identity, Side::Old, &old.malformed));
    out.malformed.extend(malformed_errors(identity, Side::New, &new.malformed));

    out.resource = resource_changes(identity, old, new);

    let old_map = by_name(old);
    let new_map = by_name(new);

    let mut names: Vec<&str> = old_map.keys().chain(new_map.keys()).copied().collect();
    names.sort_unstable();
    names.dedup();

    for name in names {
        match (old_map.get(name), new_map.get(name)) {
            (Some(before), Some(after)) => {
                for field in tracked_fields {
                    let was = before.field(field);
                    let now = after.field(field);
                    if was != now {
                        trace!(identity = %identity, sub_entity = name, field = %field, "tracked field changed");
                        out.records.push(SemanticChangeRecord {
                            identity: identity.clone(),
                            sub_entity: name.to_string(),
                            field: field.clone(),
                            old_value: was.map(str::to_string),
                            new_value: now.map(str::to_string),
                        });
                    }
                }
            }
            (Some(_), None) => out.structural.push(StructuralChange::Removed(name.to_string())),
            (None, Some(_)) => out.structural.push(StructuralChange::Added(name.to_string())),
            (None, None) => {}
        }
    }

    if !out.records.is_empty() {
        metrics::counter!("detect_records_total", out.records.len() as u64);
    }
    out
}

/// Resource-level fields are compared over the union of extracted keys;
/// only tracked fields are ever extracted into a snapshot.
fn resource_changes(identity: &ResourceIdentity, old: &ResourceSnapshot, new: &ResourceSnapshot) -> Vec<ResourceFieldChange> {
    let mut fields: Vec<&String> = old.fields.keys().chain(new.fields.keys()).collect();
    fields.sort_unstable();
    fields.dedup();
    fields
        .into_iter()
        .filter_map(|field| {
            let was = old.field(field);
            let now = new.field(field);
            (was != now).then(|| ResourceFieldChange {
                identity: identity.clone(),
                field: field.clone(),
                old_value: was.map(str::to_string),
                new_value: now.map(str::to_string),
            })
        })
        .collect()
}
