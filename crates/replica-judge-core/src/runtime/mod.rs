// crates/replica-judge-core/src/runtime/mod.rs
// ============================================================================
// Module: Replica Judge Runtime
// Description: Evaluator engine, placement helpers, and in-memory backends.
// Purpose: Provide the reconciliation loop and its supporting strategies.
// Dependencies: crate::{core, interfaces}, rand, serde_json
// ============================================================================

//! ## Overview
//! The runtime turns backlog entries into lock batches. [`Evaluator`] drives
//! passes; scope collection, rule matching, grouping, selection, quota
//! bookkeeping, and lock allocation are separate modules so each can be
//! tested on its own. In-memory collaborators and inventory snapshots live
//! here as well.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod allocator;
pub mod evaluator;
pub mod events;
pub mod grouping;
pub mod hooks;
pub mod inventory;
pub mod lifecycle;
pub mod matcher;
pub mod queries;
pub mod quota;
pub mod retry;
pub mod scope;
pub mod selector;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use evaluator::DeficitPolicy;
pub use evaluator::Evaluator;
pub use evaluator::EvaluatorConfig;
pub use evaluator::EvaluatorError;
pub use evaluator::PassReport;
pub use evaluator::PurgeReport;
pub use evaluator::RunMode;
pub use events::EvaluatorEvent;
pub use events::EvaluatorEventSink;
pub use events::EventDetail;
pub use events::FileEventSink;
pub use events::MemoryEventSink;
pub use events::NoopEventSink;
pub use events::StderrEventSink;
pub use hooks::ChangeHooks;
pub use inventory::Inventory;
pub use inventory::InventoryCollaborators;
pub use inventory::InventoryError;
pub use lifecycle::create_rule;
pub use lifecycle::get_rule;
pub use queries::list_dataset_locks;
pub use queries::list_file_locks;
pub use retry::RetryPolicy;
pub use store::InMemoryBacklog;
pub use store::InMemoryIdentifierGraph;
pub use store::InMemoryLockStore;
pub use store::InMemoryQuotaGate;
pub use store::InMemoryResourceCatalog;
pub use store::InMemoryRuleStore;
