// crates/replica-judge-core/src/runtime/scope.rs
// ============================================================================
// Module: Rule Scope
// Description: Transitive file sets below a set of identifiers.
// Purpose: Resolve which files, and which datasets they belong to, a rule
//          covers for one evaluation.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! A scope is collected by walking child edges from the starting identifiers.
//! The walk tracks visited collections so shared sub-collections (the graph is
//! a DAG) are expanded once. Dataset membership is recorded for every file so
//! grouping and dataset lock aggregation can work from one snapshot.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::DidKey;
use crate::core::DidType;
use crate::core::RseId;
use crate::interfaces::CatalogError;
use crate::interfaces::IdentifierGraph;
use crate::runtime::matcher::ancestor_closure;

// ============================================================================
// SECTION: Types
// ============================================================================

/// File reached while collecting a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFile {
    /// File identifier.
    pub did: DidKey,
    /// File size in bytes.
    pub bytes: u64,
    /// Datasets in scope that contain the file, in discovery order.
    pub datasets: Vec<DidKey>,
    /// Resources already holding a physical replica.
    pub replicas: BTreeSet<RseId>,
}

/// Snapshot of the files and datasets below a set of identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleScope {
    /// Files in discovery order.
    order: Vec<DidKey>,
    /// Files by key.
    files: BTreeMap<DidKey, ScopeFile>,
    /// Dataset members in attach order.
    datasets: BTreeMap<DidKey, Vec<DidKey>>,
    /// Datasets in discovery order.
    dataset_order: Vec<DidKey>,
}

impl RuleScope {
    /// Walks the graph below `starts` and records every reachable file.
    ///
    /// Unknown identifiers contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the graph cannot be read.
    pub fn collect(graph: &impl IdentifierGraph, starts: &[DidKey]) -> Result<Self, CatalogError> {
        let mut scope = Self::default();
        let mut visited = BTreeSet::new();
        let mut stack: Vec<DidKey> = starts.iter().rev().cloned().collect();

        while let Some(did) = stack.pop() {
            if !visited.insert(did.clone()) {
                continue;
            }
            let Some(record) = graph.did(&did)? else {
                continue;
            };
            match record.did_type {
                DidType::File => {
                    scope.add_file(graph, &did, record.bytes, None)?;
                }
                DidType::Dataset => {
                    let members = graph.children(&did)?;
                    for member in &members {
                        let bytes = graph.did(member)?.map_or(0, |member| member.bytes);
                        scope.add_file(graph, member, bytes, Some(&did))?;
                    }
                    scope.dataset_order.push(did.clone());
                    scope.datasets.insert(did, members);
                }
                DidType::Container => {
                    let children = graph.children(&did)?;
                    stack.extend(children.into_iter().rev());
                }
            }
        }
        Ok(scope)
    }

    /// Collects the part of a rule's scope affected by a change at `changed`.
    ///
    /// A changed file is widened to the parent datasets that lie below one of
    /// `roots`, so the file keeps its dataset membership. Collections and
    /// files outside any such dataset are walked as given.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the graph cannot be read.
    pub fn collect_below(
        graph: &impl IdentifierGraph,
        changed: &DidKey,
        roots: &[DidKey],
    ) -> Result<Self, CatalogError> {
        let is_file = graph.did(changed)?.is_some_and(|record| record.did_type == DidType::File);
        if !is_file {
            return Self::collect(graph, std::slice::from_ref(changed));
        }
        let mut starts = Vec::new();
        for parent in graph.parents(changed)? {
            let is_dataset =
                graph.did(&parent)?.is_some_and(|record| record.did_type == DidType::Dataset);
            if !is_dataset {
                continue;
            }
            let ancestors = ancestor_closure(graph, &parent)?;
            if roots.iter().any(|root| ancestors.contains(root)) {
                starts.push(parent);
            }
        }
        if starts.is_empty() || roots.contains(changed) {
            starts.push(changed.clone());
        }
        Self::collect(graph, &starts)
    }

    /// Records a file and, when given, its dataset membership.
    fn add_file(
        &mut self,
        graph: &impl IdentifierGraph,
        did: &DidKey,
        bytes: u64,
        dataset: Option<&DidKey>,
    ) -> Result<(), CatalogError> {
        if let Some(file) = self.files.get_mut(did) {
            if let Some(dataset) = dataset
                && !file.datasets.contains(dataset)
            {
                file.datasets.push(dataset.clone());
            }
            return Ok(());
        }
        let replicas = graph.replica_rses(did)?.into_iter().collect();
        self.order.push(did.clone());
        self.files.insert(
            did.clone(),
            ScopeFile {
                did: did.clone(),
                bytes,
                datasets: dataset.into_iter().cloned().collect(),
                replicas,
            },
        );
        Ok(())
    }

    /// Returns files in discovery order.
    pub fn files(&self) -> impl Iterator<Item = &ScopeFile> {
        self.order.iter().filter_map(|did| self.files.get(did))
    }

    /// Returns the file record for `did`.
    #[must_use]
    pub fn file(&self, did: &DidKey) -> Option<&ScopeFile> {
        self.files.get(did)
    }

    /// Returns true when `did` is a file in scope.
    #[must_use]
    pub fn contains_file(&self, did: &DidKey) -> bool {
        self.files.contains_key(did)
    }

    /// Returns datasets in discovery order with their members.
    pub fn datasets(&self) -> impl Iterator<Item = (&DidKey, &[DidKey])> {
        self.dataset_order
            .iter()
            .filter_map(|dataset| self.datasets.get_key_value(dataset))
            .map(|(dataset, members)| (dataset, members.as_slice()))
    }

    /// Returns the members of a dataset in scope.
    #[must_use]
    pub fn dataset_members(&self, dataset: &DidKey) -> Option<&[DidKey]> {
        self.datasets.get(dataset).map(Vec::as_slice)
    }

    /// Returns the number of files in scope.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.order.len()
    }
}
