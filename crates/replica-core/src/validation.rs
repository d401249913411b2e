//! Mutation validation: structural checks performed before enqueue.
//!
//! Checks that need cache state (does the entity exist, is it conflicted)
//! live in the synchronization engine.

use crate::error::ValidationError;
use crate::mutation::{MutationDraft, MutationOp};

/// Maximum length of a collection name or entity id.
pub const MAX_KEY_LEN: usize = 256;

/// Validate a draft's structure.
///
/// This performs:
/// - Key checks (non-empty, bounded length, no `/` in the collection name)
/// - Field name checks (non-empty)
/// - UPDATE must carry a non-empty patch
pub fn validate_draft(draft: &MutationDraft) -> Result<(), ValidationError> {
    let key = &draft.key;

    // 1. Collection name
    if key.collection.is_empty() || key.collection.as_str().len() > MAX_KEY_LEN {
        return Err(ValidationError::InvalidKey(format!(
            "collection name must be 1..={MAX_KEY_LEN} bytes"
        )));
    }
    if key.collection.as_str().contains('/') {
        return Err(ValidationError::InvalidKey(format!(
            "collection name {:?} contains '/'",
            key.collection.as_str()
        )));
    }

    // 2. Entity id
    if key.id.is_empty() || key.id.as_str().len() > MAX_KEY_LEN {
        return Err(ValidationError::InvalidKey(format!(
            "entity id must be 1..={MAX_KEY_LEN} bytes"
        )));
    }

    // 3. Payload
    match &draft.op {
        MutationOp::Update { patch } if patch.is_empty() => {
            return Err(ValidationError::EmptyPatch(key.clone()));
        }
        MutationOp::Create { fields: payload } | MutationOp::Update { patch: payload } => {
            if let Some(field) = payload.keys().find(|name| name.is_empty()) {
                return Err(ValidationError::InvalidField {
                    key: key.clone(),
                    field: field.clone(),
                });
            }
        }
        MutationOp::Delete => {}
    }

    Ok(())
}
