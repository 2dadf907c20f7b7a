// crates/replica-judge-core/src/runtime/hooks.rs
// ============================================================================
// Module: Identifier Mutation Hooks
// Description: Entry points the identifier graph calls after attach/detach.
// Purpose: Turn hierarchy mutations into change backlog entries.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! The hooks record the parent collection whose content changed. Rule
//! matching walks upwards from that parent, and attach evaluation walks down
//! from it, so the parent alone reaches every affected rule and file.

use crate::core::AccountId;
use crate::core::BacklogAction;
use crate::core::DidKey;
use crate::core::Timestamp;
use crate::interfaces::BacklogError;
use crate::interfaces::ChangeBacklog;

/// Mutation hooks bound to a change backlog.
#[derive(Debug, Clone)]
pub struct ChangeHooks<B> {
    /// Target backlog.
    backlog: B,
}

impl<B: ChangeBacklog> ChangeHooks<B> {
    /// Creates hooks writing into `backlog`.
    #[must_use]
    pub const fn new(backlog: B) -> Self {
        Self {
            backlog,
        }
    }

    /// Records that `children` were attached to `parent`.
    ///
    /// The actor does not influence placement. Returns false when nothing new
    /// was enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError`] when the entry cannot be stored.
    pub fn on_attach(
        &self,
        parent: &DidKey,
        children: &[DidKey],
        _actor: &AccountId,
    ) -> Result<bool, BacklogError> {
        self.record(parent, children, BacklogAction::Attach)
    }

    /// Records that `children` were detached from `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`BacklogError`] when the entry cannot be stored.
    pub fn on_detach(&self, parent: &DidKey, children: &[DidKey]) -> Result<bool, BacklogError> {
        self.record(parent, children, BacklogAction::Detach)
    }

    /// Enqueues `parent` unless the mutation was empty.
    fn record(
        &self,
        parent: &DidKey,
        children: &[DidKey],
        action: BacklogAction,
    ) -> Result<bool, BacklogError> {
        if children.is_empty() {
            return Ok(false);
        }
        self.backlog.enqueue(parent, action, Timestamp::now())
    }
}
