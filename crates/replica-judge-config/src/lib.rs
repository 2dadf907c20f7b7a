// crates/replica-judge-config/src/lib.rs
// ============================================================================
// Module: Replica Judge Config Library
// Description: Canonical config model and validation.
// Purpose: Single source of truth for replica-judge.toml semantics.
// Dependencies: replica-judge-core, replica-judge-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `replica-judge-config` defines the configuration model for the Replica
//! Judge evaluator. Loading is strict and fail-closed: oversized, non-UTF-8,
//! unknown, or inconsistent configuration is rejected before any worker
//! starts.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
