// crates/replica-judge-core/src/core/lock.rs
// ============================================================================
// Module: Replica Locks
// Description: File-level locks, dataset lock aggregates, and lock batches.
// Purpose: Represent the evaluator's placement decisions and the atomic unit
//          of change applied to the lock table.
// Dependencies: crate::core::{identifiers, time}, serde
// ============================================================================

//! ## Overview
//! A [`ReplicaLock`] asserts that a rule requires a file at a resource. Locks
//! are rule-scoped: several rules may lock the same file at the same resource.
//! [`DatasetLock`] rows summarize the file locks of one dataset, resource, and
//! rule. Every change produced for one grouping unit travels as a single
//! [`LockBatch`] so stores can commit it in one transaction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::AccountId;
use crate::core::identifiers::DidKey;
use crate::core::identifiers::RseId;
use crate::core::identifiers::RuleId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Lock State
// ============================================================================

/// Replication state of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockState {
    /// Replica exists at the resource.
    Ok,
    /// Replica is expected but not yet present.
    Replicating,
    /// Transfer for the replica failed.
    Stuck,
}

impl LockState {
    /// Returns a stable label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Replicating => "REPLICATING",
            Self::Stuck => "STUCK",
        }
    }

    /// Parses a stored state label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "OK" => Some(Self::Ok),
            "REPLICATING" => Some(Self::Replicating),
            "STUCK" => Some(Self::Stuck),
            _ => None,
        }
    }

    /// Folds member lock states into an aggregate state.
    ///
    /// Stuck dominates replicating, which dominates ok. An empty input is ok.
    #[must_use]
    pub fn aggregate(states: impl IntoIterator<Item = Self>) -> Self {
        states.into_iter().fold(Self::Ok, |acc, state| match (acc, state) {
            (Self::Stuck, _) | (_, Self::Stuck) => Self::Stuck,
            (Self::Replicating, _) | (_, Self::Replicating) => Self::Replicating,
            _ => Self::Ok,
        })
    }
}

// ============================================================================
// SECTION: Keys
// ============================================================================

/// Primary key of a file lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockKey {
    /// Locked file.
    pub did: DidKey,
    /// Resource holding the replica.
    pub rse_id: RseId,
    /// Owning rule.
    pub rule_id: RuleId,
}

/// Primary key of a dataset lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetLockKey {
    /// Summarized dataset.
    pub dataset: DidKey,
    /// Resource holding the replicas.
    pub rse_id: RseId,
    /// Owning rule.
    pub rule_id: RuleId,
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// Lock asserting that `rule_id` requires `did` at `rse_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLock {
    /// Locked file.
    pub did: DidKey,
    /// Resource holding the replica.
    pub rse_id: RseId,
    /// Owning rule.
    pub rule_id: RuleId,
    /// Account charged for the lock.
    pub account: AccountId,
    /// Replication state.
    pub state: LockState,
    /// File size in bytes.
    pub bytes: u64,
    /// Creation time.
    pub created_at: Timestamp,
}

impl ReplicaLock {
    /// Returns the lock's primary key.
    #[must_use]
    pub fn key(&self) -> LockKey {
        LockKey {
            did: self.did.clone(),
            rse_id: self.rse_id.clone(),
            rule_id: self.rule_id,
        }
    }
}

/// Aggregate of the file locks one rule holds for a dataset at a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLock {
    /// Summarized dataset.
    pub dataset: DidKey,
    /// Resource holding the replicas.
    pub rse_id: RseId,
    /// Owning rule.
    pub rule_id: RuleId,
    /// Account charged for the locks.
    pub account: AccountId,
    /// Aggregate state of the constituent file locks.
    pub state: LockState,
    /// Number of constituent file locks.
    pub length: u64,
    /// Sum of constituent file sizes.
    pub bytes: u64,
    /// Last recomputation time.
    pub updated_at: Timestamp,
}

impl DatasetLock {
    /// Returns the dataset lock's primary key.
    #[must_use]
    pub fn key(&self) -> DatasetLockKey {
        DatasetLockKey {
            dataset: self.dataset.clone(),
            rse_id: self.rse_id.clone(),
            rule_id: self.rule_id,
        }
    }
}

/// Lock listing entry returned by the lock query API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockSummary {
    /// Resource holding the replica.
    pub rse_id: RseId,
    /// Owning rule.
    pub rule_id: RuleId,
    /// Replication state.
    pub state: LockState,
}

/// Signed usage change for an account at a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCounterDelta {
    /// Charged account.
    pub account: AccountId,
    /// Resource where usage changed.
    pub rse_id: RseId,
    /// File count change.
    pub files: i64,
    /// Byte count change.
    pub bytes: i64,
}

// ============================================================================
// SECTION: Batches
// ============================================================================

/// All lock-table changes for one grouping unit of one rule.
///
/// # Invariants
/// - Stores apply a batch atomically: every change or none.
/// - Creating an existing lock and removing a missing lock are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockBatch {
    /// Rule whose locks change.
    pub rule_id: RuleId,
    /// File locks to create.
    pub create: Vec<ReplicaLock>,
    /// File locks to remove.
    pub remove: Vec<LockKey>,
    /// Dataset aggregates to insert or replace.
    pub dataset_upserts: Vec<DatasetLock>,
    /// Dataset aggregates whose last file lock disappeared.
    pub dataset_removals: Vec<DatasetLockKey>,
}

impl LockBatch {
    /// Creates an empty batch for a rule.
    #[must_use]
    pub const fn new(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            create: Vec::new(),
            remove: Vec::new(),
            dataset_upserts: Vec::new(),
            dataset_removals: Vec::new(),
        }
    }

    /// Returns true when the batch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.remove.is_empty()
            && self.dataset_upserts.is_empty()
            && self.dataset_removals.is_empty()
    }
}

/// Effective changes reported after applying a batch.
///
/// Counter deltas are derived from the rows actually inserted or deleted, so
/// replaying a batch records no usage twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockBatchOutcome {
    /// File locks actually inserted.
    pub created: u64,
    /// File locks actually deleted.
    pub removed: u64,
    /// Account usage deltas recorded with the batch.
    pub counters: Vec<AccountCounterDelta>,
}

impl LockBatchOutcome {
    /// Adds a signed usage change for one lock row.
    pub fn record(&mut self, account: &AccountId, rse_id: &RseId, bytes: u64, sign: i64) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX).saturating_mul(sign);
        let existing = self
            .counters
            .iter_mut()
            .find(|delta| &delta.account == account && &delta.rse_id == rse_id);
        if let Some(delta) = existing {
            delta.files = delta.files.saturating_add(sign);
            delta.bytes = delta.bytes.saturating_add(bytes);
            return;
        }
        self.counters.push(AccountCounterDelta {
            account: account.clone(),
            rse_id: rse_id.clone(),
            files: sign,
            bytes,
        });
    }
}
