// crates/replica-judge-core/src/runtime/queries.rs
// ============================================================================
// Module: Lock Queries
// Description: Read-only lock listings for files and datasets.
// Purpose: Answer "where is this identifier locked, by which rule" queries.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Listings are sets of `(rse_id, rule_id, state)` summaries ordered by
//! resource, then rule.

use std::collections::BTreeSet;

use crate::core::DidKey;
use crate::core::LockSummary;
use crate::interfaces::LockStore;
use crate::interfaces::StoreError;

/// Lists every rule's locks on a file.
///
/// # Errors
///
/// Returns [`StoreError`] when the lock store cannot be read.
pub fn list_file_locks(
    locks: &impl LockStore,
    did: &DidKey,
) -> Result<BTreeSet<LockSummary>, StoreError> {
    Ok(locks
        .file_locks(did)?
        .into_iter()
        .map(|lock| LockSummary {
            rse_id: lock.rse_id,
            rule_id: lock.rule_id,
            state: lock.state,
        })
        .collect())
}

/// Lists every rule's dataset locks on a dataset.
///
/// # Errors
///
/// Returns [`StoreError`] when the lock store cannot be read.
pub fn list_dataset_locks(
    locks: &impl LockStore,
    dataset: &DidKey,
) -> Result<BTreeSet<LockSummary>, StoreError> {
    Ok(locks
        .dataset_locks(dataset)?
        .into_iter()
        .map(|lock| LockSummary {
            rse_id: lock.rse_id,
            rule_id: lock.rule_id,
            state: lock.state,
        })
        .collect())
}
