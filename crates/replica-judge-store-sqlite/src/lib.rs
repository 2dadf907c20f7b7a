// crates/replica-judge-store-sqlite/src/lib.rs
// ============================================================================
// Module: Replica Judge SQLite Store
// Description: Durable backlog, rule, and lock persistence on SQLite.
// Purpose: Provide the shared database evaluator workers coordinate through.
// Dependencies: replica-judge-core, rusqlite, serde_json, thiserror
// ============================================================================

//! ## Overview
//! [`SqliteJudgeStore`] implements the change backlog, rule store, and lock
//! store interfaces of `replica-judge-core` on one `SQLite` database. Every
//! worker opens its own connection; claims and lock batches run in
//! `BEGIN IMMEDIATE` transactions so concurrent workers serialize on the
//! database write lock rather than on process-local state.

pub mod store;

pub use store::MAX_SPEC_BYTES;
pub use store::SqliteJudgeStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
