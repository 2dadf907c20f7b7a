// crates/replica-judge-core/src/runtime/inventory.rs
// ============================================================================
// Module: Inventory Snapshots
// Description: JSON snapshot of the external collaborators.
// Purpose: Load the identifier graph, resource catalog, and quotas from a
//          file for the command-line evaluator.
// Dependencies: crate::{core, interfaces, runtime::store}, serde, serde_json
// ============================================================================

//! ## Overview
//! The evaluator treats the identifier graph, resource catalog, and quota
//! gate as external. Outside a full deployment they are provided as one JSON
//! document and materialized into the in-memory collaborators. Snapshot input
//! is untrusted: the file size is capped and attachments are type-checked.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::AccountId;
use crate::core::DidKey;
use crate::core::DidRecord;
use crate::core::Rse;
use crate::core::RseId;
use crate::interfaces::CatalogError;
use crate::interfaces::QuotaError;
use crate::runtime::store::InMemoryIdentifierGraph;
use crate::runtime::store::InMemoryQuotaGate;
use crate::runtime::store::InMemoryResourceCatalog;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum inventory file size in bytes.
pub const MAX_INVENTORY_BYTES: u64 = 64 * 1024 * 1024;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Inventory loading errors.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// File could not be read.
    #[error("inventory io error: {0}")]
    Io(String),
    /// File exceeds the size limit.
    #[error("inventory exceeds size limit ({actual} > {max} bytes)")]
    TooLarge {
        /// Maximum allowed bytes.
        max: u64,
        /// Actual size.
        actual: u64,
    },
    /// Document is not valid inventory JSON.
    #[error("inventory parse error: {0}")]
    Parse(String),
    /// Graph contents were rejected.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Quota contents were rejected.
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

/// Parent/child edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Parent collection.
    pub parent: DidKey,
    /// Attached child.
    pub child: DidKey,
}

/// Physical replica location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    /// File identifier.
    pub did: DidKey,
    /// Resource holding the replica.
    pub rse_id: RseId,
}

/// Account limit and usage at one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    /// Account.
    pub account: AccountId,
    /// Resource.
    pub rse_id: RseId,
    /// Byte limit; `-1` means unlimited.
    pub limit_bytes: i64,
    /// Bytes already in use.
    #[serde(default)]
    pub used_bytes: u64,
}

/// Snapshot of the external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    /// Identifier records.
    #[serde(default)]
    pub dids: Vec<DidRecord>,
    /// Attachment edges in attach order.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Physical replicas.
    #[serde(default)]
    pub replicas: Vec<ReplicaEntry>,
    /// Storage resources.
    #[serde(default)]
    pub rses: Vec<Rse>,
    /// Explicit account limits.
    #[serde(default)]
    pub quotas: Vec<QuotaEntry>,
    /// Limit applied where no explicit limit exists; `-1` means unlimited.
    #[serde(default = "default_limit_bytes")]
    pub default_limit_bytes: i64,
}

/// Default limit sentinel for unlisted accounts.
const fn default_limit_bytes() -> i64 {
    -1
}

impl Default for Inventory {
    fn default() -> Self {
        Self {
            dids: Vec::new(),
            attachments: Vec::new(),
            replicas: Vec::new(),
            rses: Vec::new(),
            quotas: Vec::new(),
            default_limit_bytes: default_limit_bytes(),
        }
    }
}

/// In-memory collaborators built from an inventory.
#[derive(Debug, Clone)]
pub struct InventoryCollaborators {
    /// Identifier graph with replicas.
    pub graph: InMemoryIdentifierGraph,
    /// Resource catalog.
    pub catalog: InMemoryResourceCatalog,
    /// Quota gate.
    pub quota: InMemoryQuotaGate,
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl Inventory {
    /// Loads an inventory file.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError`] when the file is unreadable, too large, or
    /// malformed.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let metadata = fs::metadata(path).map_err(|err| InventoryError::Io(err.to_string()))?;
        if metadata.len() > MAX_INVENTORY_BYTES {
            return Err(InventoryError::TooLarge {
                max: MAX_INVENTORY_BYTES,
                actual: metadata.len(),
            });
        }
        let bytes = fs::read(path).map_err(|err| InventoryError::Io(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| InventoryError::Parse(err.to_string()))
    }

    /// Materializes the in-memory collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError`] when an attachment references an unknown
    /// identifier or violates type nesting.
    pub fn build(&self) -> Result<InventoryCollaborators, InventoryError> {
        let graph = InMemoryIdentifierGraph::new();
        for record in &self.dids {
            graph.add_did(record.clone())?;
        }
        for attachment in &self.attachments {
            graph.attach(&attachment.parent, &attachment.child)?;
        }
        for replica in &self.replicas {
            graph.add_replica(&replica.did, &replica.rse_id)?;
        }

        let catalog = InMemoryResourceCatalog::new();
        for rse in &self.rses {
            catalog.upsert(rse.clone())?;
        }

        let quota = InMemoryQuotaGate::with_default_limit(self.default_limit_bytes);
        for entry in &self.quotas {
            quota.set_limit(&entry.account, &entry.rse_id, entry.limit_bytes)?;
            quota.set_usage(&entry.account, &entry.rse_id, entry.used_bytes)?;
        }

        Ok(InventoryCollaborators {
            graph,
            catalog,
            quota,
        })
    }
}
