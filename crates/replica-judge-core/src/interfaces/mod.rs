// crates/replica-judge-core/src/interfaces/mod.rs
// ============================================================================
// Module: Replica Judge Interfaces
// Description: Backend-agnostic interfaces for the identifier graph, resource
//              catalog, quotas, backlog, rules, and locks.
// Purpose: Define the contract surfaces used by the evaluator runtime.
// Dependencies: crate::core, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how the evaluator integrates with external systems
//! without embedding backend-specific details. The identifier graph, resource
//! catalog, and quota gate are read-only collaborators. The backlog, rule
//! store, and lock store are mutated by the evaluator and must provide the
//! atomicity each method documents.
//!
//! All methods take `&self`; implementations that share state across workers
//! use interior locking or a database connection.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::core::AccountId;
use crate::core::BacklogAction;
use crate::core::BacklogEntry;
use crate::core::DatasetLock;
use crate::core::DidKey;
use crate::core::DidRecord;
use crate::core::LockBatch;
use crate::core::LockBatchOutcome;
use crate::core::ReplicaLock;
use crate::core::Rse;
use crate::core::RseId;
use crate::core::Rule;
use crate::core::RuleId;
use crate::core::RuleSpec;
use crate::core::RuleState;
use crate::core::RuleStateUpdate;
use crate::core::Timestamp;
use crate::core::WorkerId;

// ============================================================================
// SECTION: Identifier Graph
// ============================================================================

/// Identifier graph and replica catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Identifier is not known.
    #[error("unknown identifier {0}")]
    UnknownDid(DidKey),
    /// Child type cannot be attached below the parent type.
    #[error("cannot attach {child} below {parent}")]
    InvalidAttachment {
        /// Parent collection.
        parent: DidKey,
        /// Rejected child.
        child: DidKey,
    },
    /// Catalog backend failure.
    #[error("catalog error: {0}")]
    Backend(String),
}

/// Read-only view of the identifier hierarchy and physical replicas.
pub trait IdentifierGraph {
    /// Returns the identifier record, if known.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the lookup fails.
    fn did(&self, did: &DidKey) -> Result<Option<DidRecord>, CatalogError>;

    /// Returns the direct children of a collection in attach order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the lookup fails.
    fn children(&self, did: &DidKey) -> Result<Vec<DidKey>, CatalogError>;

    /// Returns the direct parents of an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the lookup fails.
    fn parents(&self, did: &DidKey) -> Result<Vec<DidKey>, CatalogError>;

    /// Returns the resources that physically hold a replica of a file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the lookup fails.
    fn replica_rses(&self, did: &DidKey) -> Result<Vec<RseId>, CatalogError>;
}

// ============================================================================
// SECTION: Resource Catalog
// ============================================================================

/// Read-only storage resource catalog.
pub trait ResourceCatalog {
    /// Lists every resource with its attributes, in a stable order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the catalog cannot be read.
    fn list_rses(&self) -> Result<Vec<Rse>, CatalogError>;
}

// ============================================================================
// SECTION: Quota Gate
// ============================================================================

/// Quota lookup errors.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Quota backend failure.
    #[error("quota gate error: {0}")]
    Backend(String),
}

/// Remaining allowance for an account at a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaAllowance {
    /// No limit configured (sentinel limit).
    Unlimited,
    /// Remaining bytes before the limit is reached.
    Remaining(u64),
}

impl QuotaAllowance {
    /// Returns true when `bytes` more may be charged.
    ///
    /// An exhausted allowance admits nothing, not even empty files.
    #[must_use]
    pub const fn covers(self, bytes: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Remaining(remaining) => remaining > 0 && bytes <= remaining,
        }
    }

    /// Builds an allowance from a configured limit and current usage.
    ///
    /// A negative limit is the unlimited sentinel.
    #[must_use]
    pub fn from_limit(limit_bytes: i64, used_bytes: u64) -> Self {
        u64::try_from(limit_bytes)
            .map_or(Self::Unlimited, |limit| Self::Remaining(limit.saturating_sub(used_bytes)))
    }
}

/// Read-only per-account, per-resource quota lookup.
pub trait QuotaGate {
    /// Returns the remaining allowance for `account` at `rse_id`.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError`] when the lookup fails.
    fn allowance(&self, account: &AccountId, rse_id: &RseId)
    -> Result<QuotaAllowance, QuotaError>;
}

// ============================================================================
// SECTION: Change Backlog
// ============================================================================

/// Change backlog errors.
#[derive(Debug, Error)]
pub enum BacklogError {
    /// Another worker holds the claim lock; retry later.
    #[error("backlog contention: {0}")]
    Contention(String),
    /// Backlog backend failure.
    #[error("backlog error: {0}")]
    Store(String),
}

impl BacklogError {
    /// Returns true when retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Parameters of a bounded claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Claiming worker.
    pub worker: WorkerId,
    /// Maximum distinct identifiers to claim.
    pub limit: usize,
    /// Claim time.
    pub now: Timestamp,
    /// Claims older than this are reclaimable by any worker.
    pub lease: Duration,
}

/// Evaluation lease on one rule.
///
/// A rule is evaluated by at most one worker at a time; claims older than
/// `lease` are presumed abandoned and may be taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleClaim {
    /// Claiming worker.
    pub worker: WorkerId,
    /// Claim time; together with the worker it identifies the claim.
    pub now: Timestamp,
    /// Claims older than this are reclaimable by any worker.
    pub lease: Duration,
}

/// Durable queue of changed identifiers.
///
/// # Invariants
/// - Drain order is insertion order of each identifier's oldest entry.
/// - A claimed entry is invisible to other workers until restored or its
///   lease expires.
/// - Entries are only removed by [`ChangeBacklog::acknowledge`].
pub trait ChangeBacklog {
    /// Records a change. Returns false when an identical unclaimed entry
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError`] when the entry cannot be stored.
    fn enqueue(
        &self,
        did: &DidKey,
        action: BacklogAction,
        now: Timestamp,
    ) -> Result<bool, BacklogError>;

    /// Claims every pending entry of up to `limit` distinct identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError::Contention`] when the claim conflicts with
    /// another worker.
    fn drain(&self, request: &ClaimRequest) -> Result<Vec<BacklogEntry>, BacklogError>;

    /// Removes processed entries.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError`] when the entries cannot be removed.
    fn acknowledge(&self, ids: &[u64]) -> Result<(), BacklogError>;

    /// Returns claimed entries to the pending state.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError`] when the entries cannot be released.
    fn restore(&self, ids: &[u64]) -> Result<(), BacklogError>;

    /// Returns the number of unclaimed entries.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError`] when the backlog cannot be read.
    fn pending_count(&self) -> Result<u64, BacklogError>;
}

// ============================================================================
// SECTION: Rule and Lock Stores
// ============================================================================

/// Rule and lock store errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store I/O error.
    #[error("judge store io error: {0}")]
    Io(String),
    /// Store data is corrupted or fails integrity checks.
    #[error("judge store corruption: {0}")]
    Corrupt(String),
    /// Store data version is incompatible.
    #[error("judge store version mismatch: {0}")]
    VersionMismatch(String),
    /// Store data is invalid.
    #[error("judge store invalid data: {0}")]
    Invalid(String),
    /// Write lock held by another worker; retry later.
    #[error("judge store contention: {0}")]
    Contention(String),
    /// Referenced record does not exist.
    #[error("judge store record not found: {0}")]
    NotFound(String),
    /// Store reported an error.
    #[error("judge store error: {0}")]
    Store(String),
}

impl StoreError {
    /// Returns true when retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Persistence for rules and their evaluator-owned state.
pub trait RuleStore {
    /// Stores a validated rule in the inject state and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the rule cannot be stored.
    fn create_rule(&self, spec: &RuleSpec, now: Timestamp) -> Result<RuleId, StoreError>;

    /// Loads a rule snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn get_rule(&self, rule_id: RuleId) -> Result<Option<Rule>, StoreError>;

    /// Returns every rule with at least one root in `roots`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn rules_for_roots(&self, roots: &[DidKey]) -> Result<Vec<Rule>, StoreError>;

    /// Returns up to `limit` rules in one of `states` with id above `after`,
    /// ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn rules_in_states(
        &self,
        states: &[RuleState],
        after: Option<RuleId>,
        limit: usize,
    ) -> Result<Vec<Rule>, StoreError>;

    /// Writes evaluator-owned fields of a rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the rule no longer exists.
    fn update_rule_state(
        &self,
        rule_id: RuleId,
        update: &RuleStateUpdate,
        now: Timestamp,
    ) -> Result<(), StoreError>;

    /// Returns up to `limit` rules whose lifetime elapsed at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn expired_rules(&self, now: Timestamp, limit: usize) -> Result<Vec<Rule>, StoreError>;

    /// Takes the evaluation lease on a rule.
    ///
    /// Returns false when the rule does not exist or another live claim
    /// holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the claim cannot be recorded.
    fn claim_rule(&self, rule_id: RuleId, claim: &RuleClaim) -> Result<bool, StoreError>;

    /// Releases a lease taken by `claim`; a lease since taken over by another
    /// worker is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the release cannot be recorded.
    fn release_rule(&self, rule_id: RuleId, claim: &RuleClaim) -> Result<(), StoreError>;

    /// Deletes a rule record and its lease. Locks must already be removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when deletion fails.
    fn delete_rule(&self, rule_id: RuleId) -> Result<(), StoreError>;
}

/// Persistence for replica and dataset locks.
pub trait LockStore {
    /// Returns every rule's locks on a file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn file_locks(&self, did: &DidKey) -> Result<Vec<ReplicaLock>, StoreError>;

    /// Returns every rule's dataset locks on a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn dataset_locks(&self, dataset: &DidKey) -> Result<Vec<DatasetLock>, StoreError>;

    /// Returns all file locks owned by a rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn rule_locks(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, StoreError>;

    /// Returns all dataset locks owned by a rule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when loading fails.
    fn rule_dataset_locks(&self, rule_id: RuleId) -> Result<Vec<DatasetLock>, StoreError>;

    /// Applies a batch atomically and idempotently, recording account usage
    /// deltas for the rows that actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the batch cannot be committed; nothing is
    /// applied in that case.
    fn apply(&self, batch: &LockBatch) -> Result<LockBatchOutcome, StoreError>;
}
