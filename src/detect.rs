use std::collections::HashMap;

use serde_json::Value;

use crate::crm::types::{record_id, EntityRecord};

/// Outcome of diffing freshly fetched entities against the cached snapshot.
/// `new` and `changed` are disjoint; `all` is the merged cache to persist.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub all: HashMap<String, EntityRecord>,
    pub new: Vec<EntityRecord>,
    pub changed: Vec<EntityRecord>,
}

/// Classify `incoming` entities against `known`, applying a per-partition
/// quota over the reported (new + changed) items.
///
/// `incoming` must already be ordered most-recently-modified-first; the
/// quota is consumed in that order. Every incoming entity is upserted into
/// the merged cache regardless of classification or quota, so the cache
/// stays complete. An entity whose `changed_fields` all match the cached
/// version is left unclassified. `max_per_partition: None` means unlimited.
pub fn detect(
    known: &HashMap<String, EntityRecord>,
    incoming: Vec<EntityRecord>,
    changed_fields: &[&str],
    partition_key: impl Fn(&EntityRecord) -> String,
    max_per_partition: Option<usize>,
) -> ChangeSet {
    let mut out = ChangeSet {
        all: known.clone(),
        ..ChangeSet::default()
    };
    let mut reported: HashMap<String, usize> = HashMap::new();

    for entity in incoming {
        let Some(id) = record_id(&entity).map(str::to_owned) else {
            continue;
        };

        let partition = partition_key(&entity);
        let count = reported.entry(partition).or_insert(0);
        if max_per_partition.is_none_or(|max| *count < max) {
            match known.get(&id) {
                None => {
                    out.new.push(entity.clone());
                    *count += 1;
                }
                Some(old) if fields_differ(old, &entity, changed_fields) => {
                    out.changed.push(entity.clone());
                    *count += 1;
                }
                Some(_) => {}
            }
        }

        out.all.insert(id, entity);
    }

    out
}

// Exact per-field equality; an absent field compares equal to a null one.
fn fields_differ(old: &EntityRecord, new: &EntityRecord, fields: &[&str]) -> bool {
    fields.iter().any(|f| {
        old.get(*f).unwrap_or(&Value::Null) != new.get(*f).unwrap_or(&Value::Null)
    })
}
