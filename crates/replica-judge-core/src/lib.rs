// crates/replica-judge-core/src/lib.rs
// ============================================================================
// Module: Replica Judge Core Library
// Description: Public API surface for the Replica Judge evaluator core.
// Purpose: Expose core types, collaborator interfaces, and runtime helpers.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Replica Judge core turns declarative replication rules into replica lock
//! placements. It drains a backlog of changed identifiers, matches the rules
//! that cover them, resolves eligible storage resources from boolean tag
//! expressions, groups files according to each rule's grouping policy, and
//! reconciles the lock table without exceeding account quotas.
//!
//! The core never moves bytes. Persistence, the identifier hierarchy, the
//! resource catalog, and quota accounting integrate through the traits in
//! [`interfaces`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::BacklogError;
pub use interfaces::CatalogError;
pub use interfaces::ChangeBacklog;
pub use interfaces::ClaimRequest;
pub use interfaces::IdentifierGraph;
pub use interfaces::LockStore;
pub use interfaces::QuotaAllowance;
pub use interfaces::QuotaError;
pub use interfaces::QuotaGate;
pub use interfaces::ResourceCatalog;
pub use interfaces::RuleClaim;
pub use interfaces::RuleStore;
pub use interfaces::StoreError;
pub use runtime::ChangeHooks;
pub use runtime::DeficitPolicy;
pub use runtime::Evaluator;
pub use runtime::EvaluatorConfig;
pub use runtime::EvaluatorError;
pub use runtime::EvaluatorEvent;
pub use runtime::EvaluatorEventSink;
pub use runtime::EventDetail;
pub use runtime::FileEventSink;
pub use runtime::InMemoryBacklog;
pub use runtime::InMemoryIdentifierGraph;
pub use runtime::InMemoryLockStore;
pub use runtime::InMemoryQuotaGate;
pub use runtime::InMemoryResourceCatalog;
pub use runtime::InMemoryRuleStore;
pub use runtime::Inventory;
pub use runtime::InventoryCollaborators;
pub use runtime::InventoryError;
pub use runtime::MemoryEventSink;
pub use runtime::NoopEventSink;
pub use runtime::PassReport;
pub use runtime::PurgeReport;
pub use runtime::RetryPolicy;
pub use runtime::RunMode;
pub use runtime::StderrEventSink;
pub use runtime::create_rule;
pub use runtime::get_rule;
pub use runtime::list_dataset_locks;
pub use runtime::list_file_locks;
