// crates/replica-judge-core/src/core/did.rs
// ============================================================================
// Module: Identifier Records
// Description: Identifier type and file metadata visible to the evaluator.
// Purpose: Describe nodes of the external identifier hierarchy.
// Dependencies: crate::core::identifiers, serde
// ============================================================================

//! ## Overview
//! Identifiers are files, datasets, or containers. The type never changes
//! after creation. Only files carry a byte size; collection sizes are derived.

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::DidKey;

/// Kind of node in the identifier hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DidType {
    /// Physical file; leaf of the hierarchy.
    File,
    /// Collection of files.
    Dataset,
    /// Collection of datasets and containers.
    Container,
}

impl DidType {
    /// Returns a stable label for the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "FILE",
            Self::Dataset => "DATASET",
            Self::Container => "CONTAINER",
        }
    }

    /// Returns true when `child` may be attached below this type.
    #[must_use]
    pub const fn accepts_child(self, child: Self) -> bool {
        matches!(
            (self, child),
            (Self::Dataset, Self::File) | (Self::Container, Self::Dataset | Self::Container)
        )
    }
}

/// Identifier record as exposed by the identifier graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidRecord {
    /// Identifier key.
    pub key: DidKey,
    /// Identifier type.
    pub did_type: DidType,
    /// File size in bytes (zero for collections).
    #[serde(default)]
    pub bytes: u64,
}
