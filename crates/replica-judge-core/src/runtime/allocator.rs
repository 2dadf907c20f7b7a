// crates/replica-judge-core/src/runtime/allocator.rs
// ============================================================================
// Module: Lock Allocator
// Description: Reconciles grouping units and rule scopes against the lock
//              table.
// Purpose: Compute the minimal lock batch for a unit, keep dataset lock
//          aggregates consistent, and build detach removal batches.
// Dependencies: crate::{core, runtime::scope}
// ============================================================================

//! ## Overview
//! The allocator works on in-memory indexes of a rule's current file and
//! dataset locks, loaded once per rule evaluation. Batches only contain
//! differences from those indexes, so reconciling unchanged state yields an
//! empty batch. Dataset aggregates are recomputed from the post-batch view of
//! member locks and emitted only when they differ from the stored row.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::AccountId;
use crate::core::DatasetLock;
use crate::core::DatasetLockKey;
use crate::core::DidKey;
use crate::core::LockBatch;
use crate::core::LockCounters;
use crate::core::LockKey;
use crate::core::LockState;
use crate::core::ReplicaLock;
use crate::core::RseId;
use crate::core::RuleId;
use crate::core::Timestamp;
use crate::runtime::scope::RuleScope;
use crate::runtime::scope::ScopeFile;

// ============================================================================
// SECTION: Lock Indexes
// ============================================================================

/// State and size of one indexed file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedLock {
    /// Lock state.
    pub state: LockState,
    /// File size in bytes.
    pub bytes: u64,
}

/// A rule's file locks keyed by file, then resource.
#[derive(Debug, Clone, Default)]
pub struct RuleLockIndex {
    /// Locks per file.
    by_file: BTreeMap<DidKey, BTreeMap<RseId, IndexedLock>>,
}

impl RuleLockIndex {
    /// Builds the index from a rule's stored locks.
    #[must_use]
    pub fn from_locks(locks: Vec<ReplicaLock>) -> Self {
        let mut index = Self::default();
        for lock in locks {
            index.insert(lock.did, lock.rse_id, IndexedLock {
                state: lock.state,
                bytes: lock.bytes,
            });
        }
        index
    }

    /// Inserts or replaces one lock.
    fn insert(&mut self, did: DidKey, rse_id: RseId, lock: IndexedLock) {
        self.by_file.entry(did).or_default().insert(rse_id, lock);
    }

    /// Returns the resources `did` is locked on.
    pub fn rses_for(&self, did: &DidKey) -> impl Iterator<Item = &RseId> {
        self.by_file.get(did).into_iter().flat_map(BTreeMap::keys)
    }

    /// Returns true when `did` is locked at `rse_id`.
    #[must_use]
    pub fn has(&self, did: &DidKey, rse_id: &RseId) -> bool {
        self.by_file.get(did).is_some_and(|locks| locks.contains_key(rse_id))
    }

    /// Returns the lock of `did` at `rse_id`.
    #[must_use]
    pub fn get(&self, did: &DidKey, rse_id: &RseId) -> Option<IndexedLock> {
        self.by_file.get(did).and_then(|locks| locks.get(rse_id)).copied()
    }

    /// Returns the number of locked files per resource.
    #[must_use]
    pub fn rse_counts(&self) -> BTreeMap<RseId, usize> {
        let mut counts = BTreeMap::new();
        for rse_id in self.by_file.values().flat_map(BTreeMap::keys) {
            *counts.entry(rse_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Returns every locked file.
    pub fn files(&self) -> impl Iterator<Item = &DidKey> {
        self.by_file.keys()
    }

    /// Returns lock counts per state.
    #[must_use]
    pub fn counters(&self) -> LockCounters {
        let mut counters = LockCounters::default();
        for lock in self.by_file.values().flat_map(BTreeMap::values) {
            match lock.state {
                LockState::Ok => counters.ok += 1,
                LockState::Replicating => counters.replicating += 1,
                LockState::Stuck => counters.stuck += 1,
            }
        }
        counters
    }

    /// Folds a committed batch into the index.
    pub fn absorb(&mut self, batch: &LockBatch) {
        for key in &batch.remove {
            if let Some(locks) = self.by_file.get_mut(&key.did) {
                locks.remove(&key.rse_id);
                if locks.is_empty() {
                    self.by_file.remove(&key.did);
                }
            }
        }
        for lock in &batch.create {
            self.insert(lock.did.clone(), lock.rse_id.clone(), IndexedLock {
                state: lock.state,
                bytes: lock.bytes,
            });
        }
    }
}

/// A rule's dataset locks keyed by dataset and resource.
#[derive(Debug, Clone, Default)]
pub struct DatasetLockIndex {
    /// Stored aggregates.
    rows: BTreeMap<(DidKey, RseId), DatasetLock>,
}

impl DatasetLockIndex {
    /// Builds the index from a rule's stored dataset locks.
    #[must_use]
    pub fn from_locks(locks: Vec<DatasetLock>) -> Self {
        Self {
            rows: locks
                .into_iter()
                .map(|lock| ((lock.dataset.clone(), lock.rse_id.clone()), lock))
                .collect(),
        }
    }

    /// Returns the resources holding an aggregate for `dataset`.
    fn rses_for(&self, dataset: &DidKey) -> BTreeSet<RseId> {
        self.rows
            .keys()
            .filter(|(stored, _)| stored == dataset)
            .map(|(_, rse_id)| rse_id.clone())
            .collect()
    }

    /// Returns every dataset with a stored aggregate.
    fn datasets(&self) -> BTreeSet<DidKey> {
        self.rows.keys().map(|(dataset, _)| dataset.clone()).collect()
    }

    /// Folds a committed batch into the index.
    pub fn absorb(&mut self, batch: &LockBatch) {
        for key in &batch.dataset_removals {
            self.rows.remove(&(key.dataset.clone(), key.rse_id.clone()));
        }
        for lock in &batch.dataset_upserts {
            self.rows.insert((lock.dataset.clone(), lock.rse_id.clone()), lock.clone());
        }
    }
}

// ============================================================================
// SECTION: Batch Construction
// ============================================================================

/// Fixed inputs shared by every batch built for one rule evaluation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationContext<'a> {
    /// Rule being reconciled.
    pub rule_id: RuleId,
    /// Account charged for new locks.
    pub account: &'a AccountId,
    /// Scope snapshot of the evaluation.
    pub scope: &'a RuleScope,
    /// Batch timestamp.
    pub now: Timestamp,
}

/// Returns the bytes a unit would add at `rse_id`.
#[must_use]
pub fn new_bytes_at(files: &[&ScopeFile], index: &RuleLockIndex, rse_id: &RseId) -> u64 {
    files
        .iter()
        .filter(|file| !index.has(&file.did, rse_id))
        .fold(0_u64, |total, file| total.saturating_add(file.bytes))
}

/// Builds the batch locking every unit file at every target.
#[must_use]
pub fn build_unit_batch(
    ctx: AllocationContext<'_>,
    files: &[&ScopeFile],
    targets: &[RseId],
    index: &RuleLockIndex,
    datasets: &DatasetLockIndex,
) -> LockBatch {
    let mut batch = LockBatch::new(ctx.rule_id);
    for file in files {
        for rse_id in targets {
            if index.has(&file.did, rse_id) {
                continue;
            }
            let state = if file.replicas.contains(rse_id) {
                LockState::Ok
            } else {
                LockState::Replicating
            };
            batch.create.push(ReplicaLock {
                did: file.did.clone(),
                rse_id: rse_id.clone(),
                rule_id: ctx.rule_id,
                account: ctx.account.clone(),
                state,
                bytes: file.bytes,
                created_at: ctx.now,
            });
        }
    }

    let touched: BTreeSet<DidKey> =
        files.iter().flat_map(|file| file.datasets.iter().cloned()).collect();
    reconcile_datasets(ctx, &touched, index, datasets, &mut batch);
    batch
}

/// Builds the batch removing locks of files no longer in scope.
///
/// Every stored dataset aggregate and every dataset in scope is recomputed,
/// so aggregates of datasets that left the scope are removed too.
#[must_use]
pub fn build_detach_batch(
    ctx: AllocationContext<'_>,
    index: &RuleLockIndex,
    datasets: &DatasetLockIndex,
) -> LockBatch {
    let mut batch = LockBatch::new(ctx.rule_id);
    for did in index.files() {
        if ctx.scope.contains_file(did) {
            continue;
        }
        for rse_id in index.rses_for(did) {
            batch.remove.push(LockKey {
                did: did.clone(),
                rse_id: rse_id.clone(),
                rule_id: ctx.rule_id,
            });
        }
    }
    let mut touched = datasets.datasets();
    touched.extend(ctx.scope.datasets().map(|(dataset, _)| dataset.clone()));
    reconcile_datasets(ctx, &touched, index, datasets, &mut batch);
    batch
}

/// Appends dataset aggregate upserts and removals for `touched` datasets.
///
/// Member locks are read from `index` overlaid with the batch's pending
/// creations and removals.
fn reconcile_datasets(
    ctx: AllocationContext<'_>,
    touched: &BTreeSet<DidKey>,
    index: &RuleLockIndex,
    datasets: &DatasetLockIndex,
    batch: &mut LockBatch,
) {
    let mut view = index.clone();
    view.absorb(batch);

    for dataset in touched {
        let members = ctx.scope.dataset_members(dataset).unwrap_or(&[]);
        let mut rses = datasets.rses_for(dataset);
        for member in members {
            rses.extend(view.rses_for(member).cloned());
        }
        for rse_id in rses {
            let member_locks: Vec<IndexedLock> =
                members.iter().filter_map(|member| view.get(member, &rse_id)).collect();
            let stored = datasets.rows.get(&(dataset.clone(), rse_id.clone()));
            if member_locks.is_empty() {
                if stored.is_some() {
                    batch.dataset_removals.push(DatasetLockKey {
                        dataset: dataset.clone(),
                        rse_id,
                        rule_id: ctx.rule_id,
                    });
                }
                continue;
            }
            let state = LockState::aggregate(member_locks.iter().map(|lock| lock.state));
            let length = u64::try_from(member_locks.len()).unwrap_or(u64::MAX);
            let bytes =
                member_locks.iter().fold(0_u64, |total, lock| total.saturating_add(lock.bytes));
            let unchanged = stored.is_some_and(|row| {
                row.state == state
                    && row.length == length
                    && row.bytes == bytes
                    && &row.account == ctx.account
            });
            if unchanged {
                continue;
            }
            batch.dataset_upserts.push(DatasetLock {
                dataset: dataset.clone(),
                rse_id,
                rule_id: ctx.rule_id,
                account: ctx.account.clone(),
                state,
                length,
                bytes,
                updated_at: ctx.now,
            });
        }
    }
}
