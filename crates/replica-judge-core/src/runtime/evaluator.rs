// crates/replica-judge-core/src/runtime/evaluator.rs
// ============================================================================
// Module: Evaluator Engine
// Description: Backlog-driven reconciliation of rules into replica locks.
// Purpose: Drain changed identifiers, evaluate affected rules, sweep pending
//          rules, and maintain rule state with per-unit isolation.
// Dependencies: crate::{core, interfaces, runtime}, rand, serde, thiserror
// ============================================================================

//! ## Overview
//! One pass of the [`Evaluator`]:
//! 1. claims up to `did_limit` changed identifiers from the backlog,
//! 2. evaluates every rule covering each identifier,
//! 3. sweeps up to `sweep_limit` rules still in `INJECT` or `STUCK`,
//! 4. reports counts through a [`PassReport`] and evaluator events.
//!
//! Each grouping unit's lock changes are committed as one batch. A failure
//! while processing an identifier restores its backlog entries for the next
//! pass; units committed before the failure stay committed, and reprocessing
//! them is a no-op. A failure never aborts the rest of the pass.
//!
//! Evaluation modes:
//! - **Full**: the rule's whole scope. Locks of files that left the scope are
//!   removed first, then every unit is placed. Used for detach entries, the
//!   sweep, and rules not yet injected.
//! - **Below**: only the files below a changed collection. Used for attach
//!   entries on already-injected rules. A changed file is widened to its
//!   datasets inside the rule so dataset grouping still applies.
//!
//! Every evaluation runs under a per-rule lease in the rule store. A rule
//! leased by another worker is skipped; its backlog entries are restored
//! and retried on a later pass.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::BacklogAction;
use crate::core::BacklogEntry;
use crate::core::DatasetLockKey;
use crate::core::DidKey;
use crate::core::LockBatch;
use crate::core::LockCounters;
use crate::core::LockKey;
use crate::core::Rse;
use crate::core::RseExpression;
use crate::core::RseId;
use crate::core::Rule;
use crate::core::RuleId;
use crate::core::RuleSpecError;
use crate::core::RuleState;
use crate::core::RuleStateUpdate;
use crate::core::StuckReason;
use crate::core::Timestamp;
use crate::core::WorkerId;
use crate::interfaces::BacklogError;
use crate::interfaces::CatalogError;
use crate::interfaces::ChangeBacklog;
use crate::interfaces::ClaimRequest;
use crate::interfaces::IdentifierGraph;
use crate::interfaces::LockStore;
use crate::interfaces::QuotaError;
use crate::interfaces::QuotaGate;
use crate::interfaces::ResourceCatalog;
use crate::interfaces::RuleClaim;
use crate::interfaces::RuleStore;
use crate::interfaces::StoreError;
use crate::runtime::allocator::AllocationContext;
use crate::runtime::allocator::DatasetLockIndex;
use crate::runtime::allocator::RuleLockIndex;
use crate::runtime::allocator::build_detach_batch;
use crate::runtime::allocator::build_unit_batch;
use crate::runtime::allocator::new_bytes_at;
use crate::runtime::events::EvaluatorEvent;
use crate::runtime::events::EvaluatorEventSink;
use crate::runtime::events::EventDetail;
use crate::runtime::events::NoopEventSink;
use crate::runtime::grouping::GroupingUnit;
use crate::runtime::grouping::partitioner_for;
use crate::runtime::matcher::MatchError;
use crate::runtime::matcher::rules_for;
use crate::runtime::quota::QuotaLedger;
use crate::runtime::retry::RetryPolicy;
use crate::runtime::scope::RuleScope;
use crate::runtime::selector;
use crate::runtime::selector::Candidate;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Behavior when fewer resources qualify than a unit needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeficitPolicy {
    /// Lock the qualifying resources and mark the rule stuck.
    #[default]
    PartialInject,
    /// Lock nothing for the unit and mark the rule stuck.
    Reject,
}

/// Evaluator tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorConfig {
    /// Maximum distinct identifiers claimed per pass.
    pub did_limit: usize,
    /// Maximum `INJECT`/`STUCK` rules swept per pass.
    pub sweep_limit: usize,
    /// Retry policy for transient contention.
    pub retry: RetryPolicy,
    /// Age after which another worker may reclaim backlog entries.
    pub claim_lease: Duration,
    /// Sleep between passes in loop mode.
    pub poll_interval: Duration,
    /// Deficit handling.
    pub deficit_policy: DeficitPolicy,
    /// Seed for deterministic resource selection.
    pub selection_seed: Option<u64>,
    /// Worker label used for claims and events.
    pub worker: WorkerId,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            did_limit: 1000,
            sweep_limit: 100,
            retry: RetryPolicy::default(),
            claim_lease: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
            deficit_policy: DeficitPolicy::PartialInject,
            selection_seed: None,
            worker: WorkerId::new("judge"),
        }
    }
}

/// Invocation mode for [`Evaluator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    /// Run a single pass and return.
    pub once: bool,
    /// Per-pass identifier bound.
    pub did_limit: usize,
}

// ============================================================================
// SECTION: Errors and Reports
// ============================================================================

/// Evaluator failures.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    /// Backlog failure that retries could not resolve.
    #[error(transparent)]
    Backlog(#[from] BacklogError),
    /// Rule or lock store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Identifier graph or resource catalog failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Quota gate failure.
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// Rule creation request was invalid.
    #[error(transparent)]
    Spec(#[from] RuleSpecError),
    /// Rule does not exist.
    #[error("rule {0} not found")]
    RuleNotFound(RuleId),
    /// Rule is protected against deletion.
    #[error("rule {0} is locked against deletion")]
    RuleLocked(RuleId),
    /// Another worker holds the rule's evaluation lease.
    #[error("rule {0} is being evaluated by another worker")]
    RuleBusy(RuleId),
}

impl From<MatchError> for EvaluatorError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::Catalog(err) => Self::Catalog(err),
            MatchError::Store(err) => Self::Store(err),
        }
    }
}

/// Counters for one evaluator pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Backlog entries claimed.
    pub claimed_entries: u64,
    /// Identifiers processed and acknowledged.
    pub processed_dids: u64,
    /// Identifiers restored to pending after a failure.
    pub deferred_dids: u64,
    /// Rule evaluations completed.
    pub rules_evaluated: u64,
    /// Rules evaluated by the sweep.
    pub swept_rules: u64,
    /// Rule evaluations that failed.
    pub failed_rules: u64,
    /// Evaluations that ended stuck.
    pub stuck_rules: u64,
    /// Evaluations skipped because another worker held the rule.
    pub busy_rules: u64,
    /// File locks created.
    pub locks_created: u64,
    /// File locks removed.
    pub locks_removed: u64,
}

/// Result of [`Evaluator::purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Rules removed.
    pub purged_rules: u64,
    /// File locks removed.
    pub locks_removed: u64,
}

// ============================================================================
// SECTION: Pass State
// ============================================================================

/// Rule evaluation scope.
#[derive(Debug, Clone, Copy)]
enum EvaluationMode<'a> {
    /// Whole rule scope, including removal of out-of-scope locks.
    Full,
    /// Files below one changed collection.
    Below(&'a DidKey),
}

/// Mutable state of one pass.
#[derive(Default)]
struct PassState {
    /// Quota allowances and debits.
    ledger: QuotaLedger,
    /// Resource catalog snapshot, read on first use.
    rses: Option<Arc<Vec<Rse>>>,
    /// Rules already evaluated in full this pass.
    full: BTreeSet<RuleId>,
    /// Pass counters.
    report: PassReport,
}

/// Placement decision for one unit.
struct UnitPlan {
    /// Resources every unit file is locked on.
    targets: Vec<RseId>,
    /// Reason the unit is not fully satisfied.
    stuck: Option<StuckReason>,
}

/// Outcome of an attempt to evaluate a rule under its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claimed {
    /// The rule was evaluated.
    Evaluated,
    /// Another worker holds the lease.
    Busy,
    /// The rule no longer exists.
    Gone,
}

/// Identifier-level failure with the rule being processed.
struct DidFailure {
    /// Rule being evaluated when the failure occurred.
    rule_id: Option<RuleId>,
    /// Underlying error.
    error: EvaluatorError,
}

impl From<EvaluatorError> for DidFailure {
    fn from(error: EvaluatorError) -> Self {
        Self {
            rule_id: None,
            error,
        }
    }
}

// ============================================================================
// SECTION: Evaluator
// ============================================================================

/// Rule evaluator over injected collaborators.
pub struct Evaluator<B, R, L, G, C, Q> {
    /// Change backlog.
    backlog: B,
    /// Rule store.
    rules: R,
    /// Lock store.
    locks: L,
    /// Identifier graph.
    graph: G,
    /// Resource catalog.
    catalog: C,
    /// Quota gate.
    quota: Q,
    /// Tuning knobs.
    config: EvaluatorConfig,
    /// Event sink.
    events: Arc<dyn EvaluatorEventSink>,
    /// Selection randomness.
    rng: StdRng,
    /// Last rule id visited by the sweep.
    sweep_cursor: Option<RuleId>,
}

impl<B, R, L, G, C, Q> Evaluator<B, R, L, G, C, Q>
where
    B: ChangeBacklog,
    R: RuleStore,
    L: LockStore,
    G: IdentifierGraph,
    C: ResourceCatalog,
    Q: QuotaGate,
{
    /// Creates an evaluator with default configuration and no event sink.
    #[must_use]
    pub fn new(backlog: B, rules: R, locks: L, graph: G, catalog: C, quota: Q) -> Self {
        Self {
            backlog,
            rules,
            locks,
            graph,
            catalog,
            quota,
            config: EvaluatorConfig::default(),
            events: Arc::new(NoopEventSink),
            rng: StdRng::from_entropy(),
            sweep_cursor: None,
        }
    }

    /// Replaces the configuration and reseeds selection.
    #[must_use]
    pub fn with_config(mut self, config: EvaluatorConfig) -> Self {
        self.rng = config.selection_seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        self.config = config;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EvaluatorEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Runs passes until `mode.once` or `shutdown` ends the loop.
    ///
    /// Returns the report of the last completed pass.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError`] when a pass fails as a whole.
    pub fn run(
        &mut self,
        mode: RunMode,
        shutdown: &AtomicBool,
    ) -> Result<PassReport, EvaluatorError> {
        self.config.did_limit = mode.did_limit;
        let mut last = PassReport::default();
        while !shutdown.load(Ordering::SeqCst) {
            last = self.run_pass()?;
            if mode.once {
                break;
            }
            self.idle(shutdown);
        }
        Ok(last)
    }

    /// Sleeps for the poll interval, waking early on shutdown.
    fn idle(&self, shutdown: &AtomicBool) {
        let slice = Duration::from_millis(100);
        let mut remaining = self.config.poll_interval;
        while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    /// Runs one bounded pass.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError::Backlog`] when the backlog fails with a
    /// non-transient error. Transient contention defers the backlog to the
    /// next pass instead.
    pub fn run_pass(&mut self) -> Result<PassReport, EvaluatorError> {
        let now = Timestamp::now();
        self.emit(EventDetail::PassStarted {
            did_limit: self.config.did_limit,
        });
        let mut pass = PassState::default();

        match self.claim(now) {
            Ok(entries) => self.process_backlog(entries, &mut pass),
            Err(err) if err.is_transient() => self.emit(EventDetail::BacklogDeferred {
                error: err.to_string(),
            }),
            Err(err) => return Err(err.into()),
        }
        self.sweep(&mut pass);

        let report = pass.report;
        self.emit(EventDetail::PassFinished {
            report,
        });
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Backlog
    // ------------------------------------------------------------------------

    /// Claims a bounded batch with retries.
    fn claim(&self, now: Timestamp) -> Result<Vec<BacklogEntry>, BacklogError> {
        let request = ClaimRequest {
            worker: self.config.worker.clone(),
            limit: self.config.did_limit,
            now,
            lease: self.config.claim_lease,
        };
        self.config.retry.run(|| self.backlog.drain(&request), BacklogError::is_transient)
    }

    /// Processes claimed entries identifier by identifier.
    fn process_backlog(&mut self, entries: Vec<BacklogEntry>, pass: &mut PassState) {
        pass.report.claimed_entries = u64::try_from(entries.len()).unwrap_or(u64::MAX);
        let mut order: Vec<DidKey> = Vec::new();
        let mut grouped: BTreeMap<DidKey, Vec<BacklogEntry>> = BTreeMap::new();
        for entry in entries {
            if !grouped.contains_key(&entry.did) {
                order.push(entry.did.clone());
            }
            grouped.entry(entry.did.clone()).or_default().push(entry);
        }

        for did in order {
            let entries = grouped.remove(&did).unwrap_or_default();
            let ids: Vec<u64> = entries.iter().map(|entry| entry.id).collect();
            let detach = entries.iter().any(|entry| entry.action == BacklogAction::Detach);
            match self.process_did(&did, detach, pass) {
                Ok(()) => {
                    pass.report.processed_dids += 1;
                    let acked = self
                        .config
                        .retry
                        .run(|| self.backlog.acknowledge(&ids), BacklogError::is_transient);
                    if let Err(err) = acked {
                        self.emit_failure(Some(&did), None, &err.to_string());
                    }
                }
                Err(failure) => {
                    pass.report.deferred_dids += 1;
                    self.emit_failure(Some(&did), failure.rule_id, &failure.error.to_string());
                    let restored = self
                        .config
                        .retry
                        .run(|| self.backlog.restore(&ids), BacklogError::is_transient);
                    if let Err(err) = restored {
                        self.emit_failure(Some(&did), None, &err.to_string());
                    }
                }
            }
        }
    }

    /// Evaluates every rule covering `did`.
    fn process_did(
        &mut self,
        did: &DidKey,
        detach: bool,
        pass: &mut PassState,
    ) -> Result<(), DidFailure> {
        let matched = rules_for(&self.graph, &self.rules, did).map_err(EvaluatorError::from)?;
        let changed = (!detach).then_some(did);
        for rule in matched {
            if pass.full.contains(&rule.rule_id) {
                continue;
            }
            let failure = match self.evaluate_claimed(rule.rule_id, changed, pass) {
                Ok(Claimed::Evaluated | Claimed::Gone) => continue,
                Ok(Claimed::Busy) => EvaluatorError::RuleBusy(rule.rule_id),
                Err(error) => {
                    pass.report.failed_rules += 1;
                    error
                }
            };
            return Err(DidFailure {
                rule_id: Some(rule.rule_id),
                error: failure,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------------

    /// Re-evaluates rules waiting for injection or stuck.
    fn sweep(&mut self, pass: &mut PassState) {
        let limit = self.config.sweep_limit;
        if limit == 0 {
            return;
        }
        let states = [RuleState::Inject, RuleState::Stuck];
        let listed = self.rules.rules_in_states(&states, self.sweep_cursor, limit);
        let rules = match listed {
            Ok(rules) => rules,
            Err(err) => {
                self.emit_failure(None, None, &err.to_string());
                return;
            }
        };
        self.sweep_cursor =
            if rules.len() < limit { None } else { rules.last().map(|rule| rule.rule_id) };

        for rule in rules {
            if pass.full.contains(&rule.rule_id) {
                continue;
            }
            match self.evaluate_claimed(rule.rule_id, None, pass) {
                Ok(Claimed::Evaluated) => pass.report.swept_rules += 1,
                Ok(Claimed::Busy | Claimed::Gone) => {}
                Err(err) => {
                    pass.report.failed_rules += 1;
                    self.emit_failure(None, Some(rule.rule_id), &err.to_string());
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Rule Evaluation
    // ------------------------------------------------------------------------

    /// Returns a fresh evaluation lease request for this worker.
    fn rule_claim(&self) -> RuleClaim {
        RuleClaim {
            worker: self.config.worker.clone(),
            now: Timestamp::now(),
            lease: self.config.claim_lease,
        }
    }

    /// Evaluates a rule under its evaluation lease.
    ///
    /// The rule is re-read after the lease is taken, so the evaluation starts
    /// from the state the previous holder committed. `changed` names the
    /// attached identifier for an incremental evaluation. Rules not yet
    /// injected are always evaluated in full.
    fn evaluate_claimed(
        &mut self,
        rule_id: RuleId,
        changed: Option<&DidKey>,
        pass: &mut PassState,
    ) -> Result<Claimed, EvaluatorError> {
        let claim = self.rule_claim();
        let claimed = self
            .config
            .retry
            .run(|| self.rules.claim_rule(rule_id, &claim), StoreError::is_transient)?;
        if !claimed {
            if self.rules.get_rule(rule_id)?.is_none() {
                return Ok(Claimed::Gone);
            }
            pass.report.busy_rules += 1;
            self.emit(EventDetail::RuleBusy {
                rule_id,
            });
            return Ok(Claimed::Busy);
        }

        let result = match self.rules.get_rule(rule_id) {
            Ok(Some(rule)) => {
                let mode = match changed {
                    Some(did) if rule.state != RuleState::Inject => EvaluationMode::Below(did),
                    _ => EvaluationMode::Full,
                };
                self.evaluate_rule(&rule, mode, pass).map(|()| Claimed::Evaluated)
            }
            Ok(None) => Ok(Claimed::Gone),
            Err(err) => Err(err.into()),
        };
        let released = self
            .config
            .retry
            .run(|| self.rules.release_rule(rule_id, &claim), StoreError::is_transient);
        if let Err(err) = released {
            self.emit_failure(None, Some(rule_id), &err.to_string());
        }
        result
    }

    /// Reconciles one rule and records its resulting state.
    fn evaluate_rule(
        &mut self,
        rule: &Rule,
        mode: EvaluationMode<'_>,
        pass: &mut PassState,
    ) -> Result<(), EvaluatorError> {
        let now = Timestamp::now();
        let full = matches!(mode, EvaluationMode::Full);
        if full {
            pass.full.insert(rule.rule_id);
        }
        let (counters, stuck) = self.reconcile(rule, mode, now, pass)?;
        self.finalize_rule(rule, full, stuck, counters, now, pass)
    }

    /// Applies removal and placement batches; returns counters and stuck reason.
    fn reconcile(
        &mut self,
        rule: &Rule,
        mode: EvaluationMode<'_>,
        now: Timestamp,
        pass: &mut PassState,
    ) -> Result<(LockCounters, Option<StuckReason>), EvaluatorError> {
        let scope = match mode {
            EvaluationMode::Full => RuleScope::collect(&self.graph, &rule.spec.roots)?,
            EvaluationMode::Below(did) => {
                RuleScope::collect_below(&self.graph, did, &rule.spec.roots)?
            }
        };
        let mut index = RuleLockIndex::from_locks(self.locks.rule_locks(rule.rule_id)?);
        let mut datasets =
            DatasetLockIndex::from_locks(self.locks.rule_dataset_locks(rule.rule_id)?);
        let ctx = AllocationContext {
            rule_id: rule.rule_id,
            account: &rule.spec.account,
            scope: &scope,
            now,
        };

        if matches!(mode, EvaluationMode::Full) {
            let batch = build_detach_batch(ctx, &index, &datasets);
            let label = format!("rule {} scope", rule.rule_id);
            self.commit(&label, &batch, &[], &mut index, &mut datasets, pass)?;
        }

        let expression = match RseExpression::parse(&rule.spec.rse_expression) {
            Ok(expression) => expression,
            Err(err) => {
                let reason = StuckReason::InvalidExpression {
                    message: err.to_string(),
                };
                return Ok((index.counters(), Some(reason)));
            }
        };
        let rses = self.catalog_snapshot(pass)?;
        let eligible = expression.resolve(&rses);

        let mut stuck = None;
        for unit in partitioner_for(rule.spec.grouping).partition(rule, &scope) {
            let plan = self.plan_unit(rule, &unit, &eligible, &index, pass)?;
            let batch = build_unit_batch(ctx, &unit.files, &plan.targets, &index, &datasets);
            let debits: Vec<(RseId, u64)> = plan
                .targets
                .iter()
                .map(|rse_id| (rse_id.clone(), new_bytes_at(&unit.files, &index, rse_id)))
                .collect();
            self.commit(&unit.label, &batch, &plan.targets, &mut index, &mut datasets, pass)?;
            for (rse_id, bytes) in debits {
                pass.ledger.debit(&rule.spec.account, &rse_id, bytes);
            }
            if stuck.is_none() {
                stuck = plan.stuck;
            }
        }
        Ok((index.counters(), stuck))
    }

    /// Chooses the target resources of one unit.
    fn plan_unit(
        &mut self,
        rule: &Rule,
        unit: &GroupingUnit<'_>,
        eligible: &[&Rse],
        index: &RuleLockIndex,
        pass: &mut PassState,
    ) -> Result<UnitPlan, EvaluatorError> {
        let copies = usize::try_from(rule.spec.copies).unwrap_or(usize::MAX);
        let eligible_ids: BTreeSet<&RseId> = eligible.iter().map(|rse| &rse.id).collect();
        let anchors = unit.anchor_rses(index);

        let invalid: BTreeSet<RseId> =
            anchors.iter().filter(|rse_id| !eligible_ids.contains(rse_id)).cloned().collect();
        if !invalid.is_empty() {
            let has_new_member =
                unit.files.iter().any(|file| index.rses_for(&file.did).next().is_none());
            return Ok(UnitPlan {
                targets: Vec::new(),
                stuck: has_new_member.then_some(StuckReason::AnchorUnsatisfiable {
                    rse_ids: invalid,
                }),
            });
        }

        let mut targets = Vec::new();
        let mut blocked = BTreeSet::new();
        let anchored = anchors.len().min(copies);
        for anchor in anchors.into_iter().take(copies) {
            if self.admits(rule, unit, index, &anchor, pass)? {
                targets.push(anchor);
            } else {
                blocked.insert(anchor);
            }
        }

        let wanted = copies.saturating_sub(anchored);
        if wanted > 0 {
            let mut candidates = Vec::new();
            for rse in eligible {
                if targets.contains(&rse.id) || blocked.contains(&rse.id) {
                    continue;
                }
                if !self.admits(rule, unit, index, &rse.id, pass)? {
                    blocked.insert(rse.id.clone());
                    continue;
                }
                candidates.push(Candidate {
                    rse_id: rse.id.clone(),
                    weight: rule.spec.weight.as_deref().map_or(1.0, |attr| rse.weight(attr)),
                    preferred: unit.files.iter().any(|file| file.replicas.contains(&rse.id)),
                });
            }
            targets.extend(selector::select(candidates, wanted, &mut self.rng));
        }

        if targets.len() >= copies {
            return Ok(UnitPlan {
                targets,
                stuck: None,
            });
        }
        let reason = if eligible.is_empty() {
            StuckReason::NoMatchingResources
        } else if !blocked.is_empty() {
            StuckReason::QuotaExceeded {
                rse_ids: blocked,
            }
        } else {
            StuckReason::InsufficientResources {
                required: rule.spec.copies,
                available: u32::try_from(eligible.len()).unwrap_or(u32::MAX),
            }
        };
        if self.config.deficit_policy == DeficitPolicy::Reject {
            targets.clear();
        }
        Ok(UnitPlan {
            targets,
            stuck: Some(reason),
        })
    }

    /// Returns true when the unit's new locks at `rse_id` fit the quota.
    fn admits(
        &self,
        rule: &Rule,
        unit: &GroupingUnit<'_>,
        index: &RuleLockIndex,
        rse_id: &RseId,
        pass: &mut PassState,
    ) -> Result<bool, QuotaError> {
        if unit.files.iter().all(|file| index.has(&file.did, rse_id)) {
            return Ok(true);
        }
        let bytes = new_bytes_at(&unit.files, index, rse_id);
        pass.ledger.admits(&self.quota, &rule.spec.account, rse_id, bytes)
    }

    /// Commits a batch and folds it into the indexes.
    fn commit(
        &self,
        label: &str,
        batch: &LockBatch,
        targets: &[RseId],
        index: &mut RuleLockIndex,
        datasets: &mut DatasetLockIndex,
        pass: &mut PassState,
    ) -> Result<(), EvaluatorError> {
        if batch.is_empty() {
            return Ok(());
        }
        let outcome =
            self.config.retry.run(|| self.locks.apply(batch), StoreError::is_transient)?;
        index.absorb(batch);
        datasets.absorb(batch);
        pass.report.locks_created += outcome.created;
        pass.report.locks_removed += outcome.removed;
        self.emit(EventDetail::UnitCommitted {
            rule_id: batch.rule_id,
            unit: label.to_string(),
            created: outcome.created,
            removed: outcome.removed,
            targets: targets.to_vec(),
        });
        Ok(())
    }

    /// Derives and stores the rule's state when it changed.
    fn finalize_rule(
        &self,
        rule: &Rule,
        full: bool,
        stuck: Option<StuckReason>,
        counters: LockCounters,
        now: Timestamp,
        pass: &mut PassState,
    ) -> Result<(), EvaluatorError> {
        let (state, error) = match stuck {
            Some(reason) => (RuleState::Stuck, Some(reason)),
            None if !full && rule.state == RuleState::Stuck => {
                (RuleState::Stuck, rule.error.clone())
            }
            None if counters.stuck > 0 => (RuleState::Stuck, None),
            None if counters.replicating > 0 => (RuleState::Replicating, None),
            None => (RuleState::Ok, None),
        };
        let update = RuleStateUpdate {
            state,
            error,
            counters,
        };
        let changed = update != rule.state_snapshot();
        if changed {
            self.config.retry.run(
                || self.rules.update_rule_state(rule.rule_id, &update, now),
                StoreError::is_transient,
            )?;
        }

        pass.report.rules_evaluated += 1;
        if update.state == RuleState::Stuck {
            pass.report.stuck_rules += 1;
        }
        self.emit(EventDetail::RuleEvaluated {
            rule_id: rule.rule_id,
            state: update.state,
            counters,
            changed,
        });
        if changed && let Some(reason) = update.error {
            self.emit(EventDetail::RuleStuck {
                rule_id: rule.rule_id,
                reason,
            });
        }
        Ok(())
    }

    /// Returns the pass's resource catalog snapshot.
    fn catalog_snapshot(&self, pass: &mut PassState) -> Result<Arc<Vec<Rse>>, CatalogError> {
        if let Some(rses) = &pass.rses {
            return Ok(Arc::clone(rses));
        }
        let rses = Arc::new(self.catalog.list_rses()?);
        pass.rses = Some(Arc::clone(&rses));
        Ok(rses)
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Removes a rule's locks in one batch, then the rule.
    ///
    /// Returns the number of file locks removed.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError::RuleNotFound`] for unknown rules,
    /// [`EvaluatorError::RuleLocked`] for protected rules,
    /// [`EvaluatorError::RuleBusy`] while another worker evaluates the rule,
    /// or a store error.
    pub fn purge_rule(&self, rule_id: RuleId) -> Result<u64, EvaluatorError> {
        let claim = self.rule_claim();
        let claimed = self
            .config
            .retry
            .run(|| self.rules.claim_rule(rule_id, &claim), StoreError::is_transient)?;
        if !claimed {
            return match self.rules.get_rule(rule_id)? {
                Some(_) => Err(EvaluatorError::RuleBusy(rule_id)),
                None => Err(EvaluatorError::RuleNotFound(rule_id)),
            };
        }
        let result = self.purge_claimed(rule_id);
        if result.is_err() {
            let released = self
                .config
                .retry
                .run(|| self.rules.release_rule(rule_id, &claim), StoreError::is_transient);
            if let Err(err) = released {
                self.emit_failure(None, Some(rule_id), &err.to_string());
            }
        }
        result
    }

    /// Removes a claimed rule; deleting the record drops its lease.
    fn purge_claimed(&self, rule_id: RuleId) -> Result<u64, EvaluatorError> {
        let rule = self.rules.get_rule(rule_id)?.ok_or(EvaluatorError::RuleNotFound(rule_id))?;
        if rule.spec.locked {
            return Err(EvaluatorError::RuleLocked(rule_id));
        }
        let mut batch = LockBatch::new(rule_id);
        batch.remove = self
            .locks
            .rule_locks(rule_id)?
            .into_iter()
            .map(|lock| LockKey {
                did: lock.did,
                rse_id: lock.rse_id,
                rule_id,
            })
            .collect();
        batch.dataset_removals = self
            .locks
            .rule_dataset_locks(rule_id)?
            .into_iter()
            .map(|lock| DatasetLockKey {
                dataset: lock.dataset,
                rse_id: lock.rse_id,
                rule_id,
            })
            .collect();
        let removed = if batch.is_empty() {
            0
        } else {
            self.config.retry.run(|| self.locks.apply(&batch), StoreError::is_transient)?.removed
        };
        self.config.retry.run(|| self.rules.delete_rule(rule_id), StoreError::is_transient)?;
        self.emit(EventDetail::RulePurged {
            rule_id,
            locks_removed: removed,
        });
        Ok(removed)
    }

    /// Purges up to `sweep_limit` unlocked rules whose lifetime elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluatorError`] when expired rules cannot be listed.
    pub fn purge_expired(&self, now: Timestamp) -> Result<PurgeReport, EvaluatorError> {
        let mut report = PurgeReport::default();
        for rule in self.rules.expired_rules(now, self.config.sweep_limit.max(1))? {
            match self.purge_rule(rule.rule_id) {
                Ok(removed) => {
                    report.purged_rules += 1;
                    report.locks_removed += removed;
                }
                Err(err) => self.emit_failure(None, Some(rule.rule_id), &err.to_string()),
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Records an event.
    fn emit(&self, detail: EventDetail) {
        self.events.record(&EvaluatorEvent::new(&self.config.worker, detail));
    }

    /// Records a deferred failure.
    fn emit_failure(&self, did: Option<&DidKey>, rule_id: Option<RuleId>, error: &str) {
        self.emit(EventDetail::UnitFailed {
            did: did.cloned(),
            rule_id,
            error: error.to_string(),
        });
    }
}
