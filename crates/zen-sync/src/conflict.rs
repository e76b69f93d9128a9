//! Field-level conflict detection and the four resolution strategies.

use chrono::{DateTime, Utc};

use zen_core::types::{ConflictStrategy, FieldConflict, InternalTaskData, Resolution, SYNC_FIELDS};

/// Fields whose external value differs from the local one and whose
/// external side was updated after the local task.
///
/// An empty external value means the provider does not report the field
/// and is never treated as a change.
pub fn detect(
    local: &InternalTaskData,
    local_ts: DateTime<Utc>,
    external: &InternalTaskData,
    external_ts: DateTime<Utc>,
) -> Vec<FieldConflict> {
    if external_ts <= local_ts {
        return Vec::new();
    }
    SYNC_FIELDS
        .iter()
        .filter_map(|field| {
            let l = local.field(field).unwrap_or("");
            let e = external.field(field).unwrap_or("");
            (!e.is_empty() && l != e).then(|| FieldConflict {
                field: field.to_string(),
                local_value: l.to_string(),
                external_value: e.to_string(),
                local_timestamp: local_ts,
                external_timestamp: external_ts,
                resolution: None,
            })
        })
        .collect()
}

/// Apply `strategy` to `local`, recording each decision on its conflict.
/// Returns the fields that now hold the external value.
///
/// `ManualReview` decides nothing and leaves `local` untouched.
pub fn resolve(
    strategy: ConflictStrategy,
    local: &mut InternalTaskData,
    conflicts: &mut [FieldConflict],
) -> Vec<String> {
    let mut changed = Vec::new();
    for c in conflicts.iter_mut() {
        let resolution = match strategy {
            ConflictStrategy::LocalWins => Resolution::Local,
            ConflictStrategy::RemoteWins => Resolution::External,
            ConflictStrategy::Timestamp => {
                if c.external_timestamp > c.local_timestamp {
                    Resolution::External
                } else {
                    Resolution::Local
                }
            }
            ConflictStrategy::ManualReview => continue,
        };
        if resolution == Resolution::External && local.set_field(&c.field, &c.external_value) {
            changed.push(c.field.clone());
        }
        c.resolution = Some(resolution);
    }
    changed
}
