// crates/replica-judge-core/src/core/rule.rs
// ============================================================================
// Module: Replication Rules
// Description: Rule definitions, lifecycle state, and stuck reasons.
// Purpose: Describe declarative replication intent and the evaluator-owned
//          state derived from it.
// Dependencies: crate::core::{expression, identifiers, time}, serde, thiserror
// ============================================================================

//! ## Overview
//! A [`RuleSpec`] is the immutable request ("keep N copies of these roots on
//! storage matching an expression"). A [`Rule`] is the stored record: the spec
//! plus a store-assigned id and the state the evaluator maintains. Specs are
//! validated once at creation time; the evaluator assumes stored specs are
//! well-formed and reports parse failures as a stuck reason rather than an
//! error.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::expression::ExpressionError;
use crate::core::expression::RseExpression;
use crate::core::identifiers::AccountId;
use crate::core::identifiers::DidKey;
use crate::core::identifiers::RseId;
use crate::core::identifiers::RuleId;
use crate::core::identifiers::SubscriptionId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum number of copies a single rule may request.
pub const MAX_RULE_COPIES: u32 = 64;
/// Maximum number of root identifiers per rule.
pub const MAX_RULE_ROOTS: usize = 1024;

// ============================================================================
// SECTION: Enumerations
// ============================================================================

/// Unit at which resource-selection outcomes are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Grouping {
    /// Every file in the rule's scope shares one outcome.
    All,
    /// Files of the same dataset share one outcome.
    Dataset,
    /// Every file is placed independently.
    None,
}

impl Grouping {
    /// Returns a stable label for the grouping.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Dataset => "DATASET",
            Self::None => "NONE",
        }
    }
}

/// Lifecycle state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleState {
    /// Created but not yet evaluated.
    Inject,
    /// Locks placed; some replicas still being transferred.
    Replicating,
    /// Target cannot currently be fully satisfied.
    Stuck,
    /// Every lock is satisfied.
    Ok,
}

impl RuleState {
    /// Returns a stable label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inject => "INJECT",
            Self::Replicating => "REPLICATING",
            Self::Stuck => "STUCK",
            Self::Ok => "OK",
        }
    }

    /// Parses a stored state label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "INJECT" => Some(Self::Inject),
            "REPLICATING" => Some(Self::Replicating),
            "STUCK" => Some(Self::Stuck),
            "OK" => Some(Self::Ok),
            _ => None,
        }
    }
}

/// Reason a rule is in the [`RuleState::Stuck`] state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StuckReason {
    /// No resource satisfies the rule's expression.
    NoMatchingResources,
    /// Fewer eligible resources than requested copies.
    InsufficientResources {
        /// Requested copies.
        required: u32,
        /// Eligible resources found.
        available: u32,
    },
    /// The account has no remaining quota at the listed resources.
    QuotaExceeded {
        /// Resources where quota blocked placement.
        rse_ids: BTreeSet<RseId>,
    },
    /// Anchor resources of a grouping unit no longer satisfy the expression.
    AnchorUnsatisfiable {
        /// Anchor resources that failed the expression.
        rse_ids: BTreeSet<RseId>,
    },
    /// The stored expression failed to parse.
    InvalidExpression {
        /// Parser diagnostic.
        message: String,
    },
}

impl StuckReason {
    /// Returns the stable label used in events and stored records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoMatchingResources => "no_matching_resources",
            Self::InsufficientResources {
                ..
            } => "insufficient_resources",
            Self::QuotaExceeded {
                ..
            } => "quota_exceeded",
            Self::AnchorUnsatisfiable {
                ..
            } => "anchor_unsatisfiable",
            Self::InvalidExpression {
                ..
            } => "invalid_expression",
        }
    }
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingResources => f.write_str("no resource matches the rse expression"),
            Self::InsufficientResources {
                required,
                available,
            } => write!(f, "{available} eligible resources for {required} copies"),
            Self::QuotaExceeded {
                rse_ids,
            } => write!(f, "quota exceeded at {}", join_rses(rse_ids)),
            Self::AnchorUnsatisfiable {
                rse_ids,
            } => write!(f, "anchor resources no longer match: {}", join_rses(rse_ids)),
            Self::InvalidExpression {
                message,
            } => write!(f, "invalid rse expression: {message}"),
        }
    }
}

/// Joins resource ids for display.
fn join_rses(rse_ids: &BTreeSet<RseId>) -> String {
    rse_ids.iter().map(RseId::as_str).collect::<Vec<_>>().join(",")
}

// ============================================================================
// SECTION: Rule Specification
// ============================================================================

/// Creation-time validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleSpecError {
    /// No root identifiers were given.
    #[error("rule requires at least one root identifier")]
    NoRoots,
    /// Too many root identifiers.
    #[error("rule has {actual} roots (max {max})")]
    TooManyRoots {
        /// Maximum allowed roots.
        max: usize,
        /// Supplied roots.
        actual: usize,
    },
    /// The same root was listed twice.
    #[error("duplicate rule root {0}")]
    DuplicateRoot(DidKey),
    /// Copies outside `1..=MAX_RULE_COPIES`.
    #[error("copies must be between 1 and {max}, got {actual}")]
    InvalidCopies {
        /// Maximum allowed copies.
        max: u32,
        /// Supplied copies.
        actual: u32,
    },
    /// Weight attribute name was blank.
    #[error("weight attribute name must not be empty")]
    EmptyWeight,
    /// Account was blank.
    #[error("account must not be empty")]
    EmptyAccount,
    /// Expression failed to parse.
    #[error("invalid rse expression: {0}")]
    Expression(#[from] ExpressionError),
    /// A root identifier is not known to the identifier graph.
    #[error("unknown root identifier {0}")]
    UnknownRoot(DidKey),
}

/// Requested replication rule, as submitted to `create_rule`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Root identifiers whose transitive file sets the rule covers.
    pub roots: Vec<DidKey>,
    /// Account owning the rule and charged for its locks.
    pub account: AccountId,
    /// Desired replica count.
    pub copies: u32,
    /// Boolean expression selecting eligible resources.
    pub rse_expression: String,
    /// Grouping policy.
    pub grouping: Grouping,
    /// Optional attribute name used as placement weight.
    #[serde(default)]
    pub weight: Option<String>,
    /// Optional lifetime in seconds from creation.
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    /// Manual-delete protection flag.
    #[serde(default)]
    pub locked: bool,
    /// Opaque provenance tag.
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
}

impl RuleSpec {
    /// Validates structural constraints of the request.
    ///
    /// # Errors
    ///
    /// Returns [`RuleSpecError`] when a constraint is violated.
    pub fn validate(&self) -> Result<(), RuleSpecError> {
        if self.roots.is_empty() {
            return Err(RuleSpecError::NoRoots);
        }
        if self.roots.len() > MAX_RULE_ROOTS {
            return Err(RuleSpecError::TooManyRoots {
                max: MAX_RULE_ROOTS,
                actual: self.roots.len(),
            });
        }
        let mut seen = BTreeSet::new();
        for root in &self.roots {
            if !seen.insert(root) {
                return Err(RuleSpecError::DuplicateRoot(root.clone()));
            }
        }
        if self.copies == 0 || self.copies > MAX_RULE_COPIES {
            return Err(RuleSpecError::InvalidCopies {
                max: MAX_RULE_COPIES,
                actual: self.copies,
            });
        }
        if self.account.as_str().trim().is_empty() {
            return Err(RuleSpecError::EmptyAccount);
        }
        if self.weight.as_deref().is_some_and(|weight| weight.trim().is_empty()) {
            return Err(RuleSpecError::EmptyWeight);
        }
        RseExpression::parse(&self.rse_expression)?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Stored Rule
// ============================================================================

/// Lock counts per state for one rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockCounters {
    /// Locks whose replica exists.
    pub ok: u64,
    /// Locks awaiting a transfer.
    pub replicating: u64,
    /// Locks whose transfer failed.
    pub stuck: u64,
}

/// Stored rule with evaluator-maintained state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Store-assigned identifier.
    pub rule_id: RuleId,
    /// Immutable request.
    pub spec: RuleSpec,
    /// Current lifecycle state.
    pub state: RuleState,
    /// Stuck reason, present only in the stuck state.
    #[serde(default)]
    pub error: Option<StuckReason>,
    /// Lock counters.
    #[serde(default)]
    pub counters: LockCounters,
    /// Creation time.
    pub created_at: Timestamp,
    /// Expiry time derived from the lifetime.
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

impl Rule {
    /// Creates a freshly injected rule record.
    #[must_use]
    pub fn new(rule_id: RuleId, spec: RuleSpec, created_at: Timestamp) -> Self {
        let expires_at =
            spec.lifetime_secs.map(|secs| created_at.saturating_add(Duration::from_secs(secs)));
        Self {
            rule_id,
            spec,
            state: RuleState::Inject,
            error: None,
            counters: LockCounters::default(),
            created_at,
            expires_at,
        }
    }

    /// Returns true when the rule's lifetime has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Returns the evaluator-owned part of the record.
    #[must_use]
    pub fn state_snapshot(&self) -> RuleStateUpdate {
        RuleStateUpdate {
            state: self.state,
            error: self.error.clone(),
            counters: self.counters,
        }
    }
}

/// Evaluator-owned rule fields written after an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStateUpdate {
    /// New lifecycle state.
    pub state: RuleState,
    /// New stuck reason.
    pub error: Option<StuckReason>,
    /// New lock counters.
    pub counters: LockCounters,
}
