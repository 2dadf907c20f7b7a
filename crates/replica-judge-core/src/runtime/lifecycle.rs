// crates/replica-judge-core/src/runtime/lifecycle.rs
// ============================================================================
// Module: Rule Lifecycle
// Description: Validated rule creation and snapshot lookup.
// Purpose: Reject malformed rules before they reach the store.
// Dependencies: crate::{core, interfaces, runtime::evaluator}
// ============================================================================

//! ## Overview
//! Creation validates the request and checks every root against the
//! identifier graph. A stored rule starts in `INJECT`; the next evaluator
//! sweep places its locks.

use crate::core::Rule;
use crate::core::RuleId;
use crate::core::RuleSpec;
use crate::core::RuleSpecError;
use crate::core::Timestamp;
use crate::interfaces::IdentifierGraph;
use crate::interfaces::RuleStore;
use crate::runtime::evaluator::EvaluatorError;

/// Validates and stores a rule.
///
/// # Errors
///
/// Returns [`EvaluatorError::Spec`] for invalid requests or unknown roots,
/// and graph or store errors otherwise.
pub fn create_rule(
    graph: &impl IdentifierGraph,
    rules: &impl RuleStore,
    spec: &RuleSpec,
) -> Result<RuleId, EvaluatorError> {
    spec.validate()?;
    for root in &spec.roots {
        if graph.did(root)?.is_none() {
            return Err(RuleSpecError::UnknownRoot(root.clone()).into());
        }
    }
    Ok(rules.create_rule(spec, Timestamp::now())?)
}

/// Loads a rule snapshot.
///
/// # Errors
///
/// Returns [`EvaluatorError::RuleNotFound`] when the rule does not exist.
pub fn get_rule(rules: &impl RuleStore, rule_id: RuleId) -> Result<Rule, EvaluatorError> {
    rules.get_rule(rule_id)?.ok_or(EvaluatorError::RuleNotFound(rule_id))
}
