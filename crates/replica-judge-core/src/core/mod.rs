// crates/replica-judge-core/src/core/mod.rs
// ============================================================================
// Module: Replica Judge Core Types
// Description: Canonical identifier, rule, lock, resource, and backlog types.
// Purpose: Provide stable, serializable types shared by every evaluator surface.
// Dependencies: serde, smallvec, thiserror
// ============================================================================

//! ## Overview
//! Core types define the identifier hierarchy vocabulary, replication rules,
//! replica and dataset locks, storage resources, and the change backlog
//! records. These types are the canonical source of truth for persistence
//! backends and the CLI.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod backlog;
pub mod did;
pub mod expression;
pub mod identifiers;
pub mod lock;
pub mod rse;
pub mod rule;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use backlog::BacklogAction;
pub use backlog::BacklogEntry;
pub use did::DidRecord;
pub use did::DidType;
pub use expression::ExpressionError;
pub use expression::RseExpression;
pub use expression::RseTerm;
pub use identifiers::AccountId;
pub use identifiers::DidKey;
pub use identifiers::RseId;
pub use identifiers::RuleId;
pub use identifiers::Scope;
pub use identifiers::SubscriptionId;
pub use identifiers::WorkerId;
pub use lock::AccountCounterDelta;
pub use lock::DatasetLock;
pub use lock::DatasetLockKey;
pub use lock::LockBatch;
pub use lock::LockBatchOutcome;
pub use lock::LockKey;
pub use lock::LockState;
pub use lock::LockSummary;
pub use lock::ReplicaLock;
pub use rse::AttributeValue;
pub use rse::Rse;
pub use rule::Grouping;
pub use rule::LockCounters;
pub use rule::Rule;
pub use rule::RuleSpec;
pub use rule::RuleSpecError;
pub use rule::RuleState;
pub use rule::RuleStateUpdate;
pub use rule::StuckReason;
pub use time::Timestamp;
