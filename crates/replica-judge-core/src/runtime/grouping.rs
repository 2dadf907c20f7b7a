// crates/replica-judge-core/src/runtime/grouping.rs
// ============================================================================
// Module: Grouping Resolver
// Description: Partitions a rule scope into units sharing one placement.
// Purpose: Dispatch ALL, DATASET, and NONE grouping to distinct strategies
//          and expose each unit's anchor resources.
// Dependencies: crate::{core, runtime::allocator, runtime::scope}
// ============================================================================

//! ## Overview
//! Each grouping policy is a [`Partitioner`]. A [`GroupingUnit`] carries the
//! files that need placement plus the set of identifiers whose existing locks
//! define the unit's anchor:
//! - `ALL`: one unit; the anchor is every lock the rule holds.
//! - `DATASET`: one unit per dataset; the anchor is the locks on any member of
//!   that dataset. Files reached without a dataset form their own units.
//! - `NONE`: one unit per file; the anchor is the file's own locks.
//!
//! Anchors are what keeps placement sticky as the graph grows: new members of
//! a unit follow the resources its existing members are locked on.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::DidKey;
use crate::core::Grouping;
use crate::core::RseId;
use crate::core::Rule;
use crate::runtime::allocator::RuleLockIndex;
use crate::runtime::scope::RuleScope;
use crate::runtime::scope::ScopeFile;

// ============================================================================
// SECTION: Units
// ============================================================================

/// Identifiers whose existing locks anchor a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorScope<'a> {
    /// Every lock held by the rule.
    Rule,
    /// Locks on the listed files.
    Members(Vec<&'a DidKey>),
}

/// Set of files sharing one resource-selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingUnit<'a> {
    /// Human-readable unit label for events.
    pub label: String,
    /// Files to place.
    pub files: Vec<&'a ScopeFile>,
    /// Anchor source.
    pub anchor: AnchorScope<'a>,
}

impl GroupingUnit<'_> {
    /// Returns the unit's anchor resources, most-locked first.
    #[must_use]
    pub fn anchor_rses(&self, index: &RuleLockIndex) -> Vec<RseId> {
        let counts: BTreeMap<RseId, usize> = match &self.anchor {
            AnchorScope::Rule => index.rse_counts(),
            AnchorScope::Members(members) => {
                let mut counts = BTreeMap::new();
                for member in members {
                    for rse_id in index.rses_for(member) {
                        *counts.entry(rse_id.clone()).or_insert(0) += 1;
                    }
                }
                counts
            }
        };
        let mut ranked: Vec<(RseId, usize)> = counts.into_iter().collect();
        ranked.sort_by(|(left_id, left), (right_id, right)| {
            right.cmp(left).then_with(|| left_id.cmp(right_id))
        });
        ranked.into_iter().map(|(rse_id, _)| rse_id).collect()
    }
}

// ============================================================================
// SECTION: Strategies
// ============================================================================

/// Grouping strategy splitting a scope into units.
pub trait Partitioner {
    /// Returns the units of `scope` in a stable order.
    fn partition<'a>(&self, rule: &Rule, scope: &'a RuleScope) -> Vec<GroupingUnit<'a>>;
}

/// `ALL` grouping strategy.
pub struct AllPartitioner;

impl Partitioner for AllPartitioner {
    fn partition<'a>(&self, rule: &Rule, scope: &'a RuleScope) -> Vec<GroupingUnit<'a>> {
        let files: Vec<&ScopeFile> = scope.files().collect();
        if files.is_empty() {
            return Vec::new();
        }
        vec![GroupingUnit {
            label: format!("rule {} all", rule.rule_id),
            files,
            anchor: AnchorScope::Rule,
        }]
    }
}

/// `DATASET` grouping strategy.
pub struct DatasetPartitioner;

impl Partitioner for DatasetPartitioner {
    fn partition<'a>(&self, rule: &Rule, scope: &'a RuleScope) -> Vec<GroupingUnit<'a>> {
        let mut units = Vec::new();
        let mut assigned: BTreeSet<&DidKey> = BTreeSet::new();
        for (dataset, members) in scope.datasets() {
            let files: Vec<&ScopeFile> = members
                .iter()
                .filter(|member| assigned.insert(*member))
                .filter_map(|member| scope.file(member))
                .collect();
            if files.is_empty() {
                continue;
            }
            units.push(GroupingUnit {
                label: format!("rule {} dataset {dataset}", rule.rule_id),
                files,
                anchor: AnchorScope::Members(members.iter().collect()),
            });
        }
        for file in scope.files().filter(|file| file.datasets.is_empty()) {
            units.push(single_file_unit(rule, file));
        }
        units
    }
}

/// `NONE` grouping strategy.
pub struct NonePartitioner;

impl Partitioner for NonePartitioner {
    fn partition<'a>(&self, rule: &Rule, scope: &'a RuleScope) -> Vec<GroupingUnit<'a>> {
        scope.files().map(|file| single_file_unit(rule, file)).collect()
    }
}

/// Builds a unit holding one file anchored on its own locks.
fn single_file_unit<'a>(rule: &Rule, file: &'a ScopeFile) -> GroupingUnit<'a> {
    GroupingUnit {
        label: format!("rule {} file {}", rule.rule_id, file.did),
        files: vec![file],
        anchor: AnchorScope::Members(vec![&file.did]),
    }
}

/// Returns the strategy for a grouping policy.
#[must_use]
pub fn partitioner_for(grouping: Grouping) -> &'static dyn Partitioner {
    match grouping {
        Grouping::All => &AllPartitioner,
        Grouping::Dataset => &DatasetPartitioner,
        Grouping::None => &NonePartitioner,
    }
}
