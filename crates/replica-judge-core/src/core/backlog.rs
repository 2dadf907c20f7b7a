// crates/replica-judge-core/src/core/backlog.rs
// ============================================================================
// Module: Change Backlog Records
// Description: Entries recording identifiers changed since last evaluation.
// Purpose: Shared record shape for in-memory and durable backlogs.
// Dependencies: crate::core::{identifiers, time}, serde
// ============================================================================

//! ## Overview
//! Each entry names the collection whose content changed and whether files
//! joined or left it. Entry ids are assigned by the backlog and grow with
//! insertion order, which is also drain order.

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::DidKey;
use crate::core::time::Timestamp;

/// Kind of identifier mutation recorded in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BacklogAction {
    /// Children were attached.
    Attach,
    /// Children were detached.
    Detach,
}

impl BacklogAction {
    /// Returns a stable label for the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "ATTACH",
            Self::Detach => "DETACH",
        }
    }

    /// Parses a stored action label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "ATTACH" => Some(Self::Attach),
            "DETACH" => Some(Self::Detach),
            _ => None,
        }
    }
}

/// Pending or claimed backlog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogEntry {
    /// Backlog-assigned, insertion-ordered id.
    pub id: u64,
    /// Changed identifier.
    pub did: DidKey,
    /// Mutation kind.
    pub action: BacklogAction,
    /// Enqueue time.
    pub enqueued_at: Timestamp,
}
