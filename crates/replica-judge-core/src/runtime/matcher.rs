// crates/replica-judge-core/src/runtime/matcher.rs
// ============================================================================
// Module: Rule Matching
// Description: Finds rules whose scope contains a changed identifier.
// Purpose: Map backlog entries to affected rules through ancestor closure.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! A rule covers an identifier when one of its roots is the identifier itself
//! or any collection reachable upwards through attach edges. Ancestors are
//! collected breadth-first with a visited set, then matched against rule
//! roots in one store query.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use thiserror::Error;

use crate::core::DidKey;
use crate::core::Rule;
use crate::interfaces::CatalogError;
use crate::interfaces::IdentifierGraph;
use crate::interfaces::RuleStore;
use crate::interfaces::StoreError;

/// Returns `did` and every ancestor collection, nearest first.
///
/// # Errors
///
/// Returns [`CatalogError`] when the graph cannot be read.
pub fn ancestor_closure(
    graph: &impl IdentifierGraph,
    did: &DidKey,
) -> Result<Vec<DidKey>, CatalogError> {
    let mut closure = Vec::new();
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([did.clone()]);
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for parent in graph.parents(&current)? {
            if !visited.contains(&parent) {
                queue.push_back(parent);
            }
        }
        closure.push(current);
    }
    Ok(closure)
}

/// Failure while matching rules.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Identifier graph lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Rule store lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Returns every rule covering `did`, ordered by rule id.
///
/// # Errors
///
/// Returns [`MatchError`] when the graph or rule store cannot be read.
pub fn rules_for(
    graph: &impl IdentifierGraph,
    rules: &impl RuleStore,
    did: &DidKey,
) -> Result<Vec<Rule>, MatchError> {
    let closure = ancestor_closure(graph, did)?;
    Ok(rules.rules_for_roots(&closure)?)
}
