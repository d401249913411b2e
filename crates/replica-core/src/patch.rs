//! Patch application: the projection function.
//!
//! The visible value of an entity is a left fold of its pending operations over
//! the last remote snapshot:
//!
//! ```text
//! projection = apply_patches(snapshot_fields, [op_1, op_2, ..., op_n])
//! ```
//!
//! `None` denotes a tombstone (deleted or never created).

use serde_json::Value;

use crate::mutation::MutationOp;
use crate::types::Fields;

/// Merge an UPDATE patch into a field map. `null` removes the field.
pub fn merge_patch(fields: &mut Fields, patch: &Fields) {
    for (name, value) in patch {
        if value.is_null() {
            fields.remove(name);
        } else {
            fields.insert(name.clone(), value.clone());
        }
    }
}

/// Apply one operation on top of a base value.
pub fn apply_op(base: Option<&Fields>, op: &MutationOp) -> Option<Fields> {
    match op {
        MutationOp::Create { fields } => Some(fields.clone()),
        MutationOp::Update { patch } => base.map(|base| {
            let mut next = base.clone();
            merge_patch(&mut next, patch);
            next
        }),
        MutationOp::Delete => None,
    }
}

/// Apply a sequence of operations in order.
pub fn apply_patches<'a, I>(base: Option<&Fields>, ops: I) -> Option<Fields>
where
    I: IntoIterator<Item = &'a MutationOp>,
{
    ops.into_iter()
        .fold(base.cloned(), |acc, op| apply_op(acc.as_ref(), op))
}

/// The minimal UPDATE patch that turns `from` into `to`.
pub fn diff_fields(from: &Fields, to: &Fields) -> Fields {
    let mut patch = Fields::new();
    for (name, value) in to {
        if from.get(name) != Some(value) {
            patch.insert(name.clone(), value.clone());
        }
    }
    for name in from.keys() {
        if !to.contains_key(name) {
            patch.insert(name.clone(), Value::Null);
        }
    }
    patch
}
