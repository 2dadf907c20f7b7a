// crates/replica-judge-core/tests/evaluator.rs
// ============================================================================
// Module: Evaluator Tests
// Description: End-to-end placement scenarios over in-memory collaborators.
// ============================================================================
//! ## Overview
//! Exercises grouping, stickiness, quota handling, stuck reasons, detach
//! removal, failure isolation, idempotent re-evaluation, and rule leases
//! shared by two workers.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    clippy::missing_docs_in_private_items,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use replica_judge_core::AccountId;
use replica_judge_core::AttributeValue;
use replica_judge_core::ChangeBacklog;
use replica_judge_core::ChangeHooks;
use replica_judge_core::DatasetLock;
use replica_judge_core::DeficitPolicy;
use replica_judge_core::DidKey;
use replica_judge_core::DidType;
use replica_judge_core::Evaluator;
use replica_judge_core::EvaluatorConfig;
use replica_judge_core::Grouping;
use replica_judge_core::InMemoryBacklog;
use replica_judge_core::InMemoryIdentifierGraph;
use replica_judge_core::InMemoryLockStore;
use replica_judge_core::InMemoryQuotaGate;
use replica_judge_core::InMemoryResourceCatalog;
use replica_judge_core::InMemoryRuleStore;
use replica_judge_core::LockBatch;
use replica_judge_core::LockBatchOutcome;
use replica_judge_core::LockState;
use replica_judge_core::LockStore;
use replica_judge_core::MemoryEventSink;
use replica_judge_core::PassReport;
use replica_judge_core::ReplicaLock;
use replica_judge_core::RetryPolicy;
use replica_judge_core::Rse;
use replica_judge_core::RseId;
use replica_judge_core::RuleId;
use replica_judge_core::RuleSpec;
use replica_judge_core::RuleState;
use replica_judge_core::RuleStore;
use replica_judge_core::RunMode;
use replica_judge_core::StoreError;
use replica_judge_core::StuckReason;
use replica_judge_core::Timestamp;
use replica_judge_core::WorkerId;
use replica_judge_core::create_rule;
use replica_judge_core::get_rule;
use replica_judge_core::list_dataset_locks;
use replica_judge_core::list_file_locks;

// ============================================================================
// SECTION: Test Helpers
// ============================================================================

type TestEvaluator<L = InMemoryLockStore> = Evaluator<
    InMemoryBacklog,
    InMemoryRuleStore,
    L,
    InMemoryIdentifierGraph,
    InMemoryResourceCatalog,
    InMemoryQuotaGate,
>;

fn did(name: &str) -> DidKey {
    DidKey::new("user.jdoe", name)
}

fn account() -> AccountId {
    AccountId::new("jdoe")
}

fn rse(name: &str) -> RseId {
    RseId::new(name)
}

fn tagged(name: &str, tag: &str) -> Rse {
    Rse::new(name).with_attribute(tag, AttributeValue::Bool(true))
}

fn spec(roots: Vec<DidKey>, copies: u32, expression: &str, grouping: Grouping) -> RuleSpec {
    RuleSpec {
        roots,
        account: account(),
        copies,
        rse_expression: expression.to_string(),
        grouping,
        weight: None,
        lifetime_secs: None,
        locked: false,
        subscription_id: None,
    }
}

fn t1_rses() -> BTreeSet<RseId> {
    [rse("MOCK"), rse("MOCK3"), rse("MOCK5")].into_iter().collect()
}

struct Harness {
    backlog: InMemoryBacklog,
    rules: InMemoryRuleStore,
    locks: InMemoryLockStore,
    graph: InMemoryIdentifierGraph,
    catalog: InMemoryResourceCatalog,
    quota: InMemoryQuotaGate,
    events: Arc<MemoryEventSink>,
}

impl Harness {
    fn new() -> Self {
        let catalog = InMemoryResourceCatalog::new();
        for rse in [
            tagged("MOCK", "T1"),
            tagged("MOCK3", "T1"),
            tagged("MOCK4", "T2"),
            tagged("MOCK5", "T1"),
        ] {
            catalog.upsert(rse).unwrap();
        }
        Self {
            backlog: InMemoryBacklog::new(),
            rules: InMemoryRuleStore::new(),
            locks: InMemoryLockStore::new(),
            graph: InMemoryIdentifierGraph::new(),
            catalog,
            quota: InMemoryQuotaGate::new(),
            events: Arc::new(MemoryEventSink::new()),
        }
    }

    fn config() -> EvaluatorConfig {
        EvaluatorConfig {
            retry: RetryPolicy::none(),
            selection_seed: Some(7),
            ..EvaluatorConfig::default()
        }
    }

    fn evaluator(&self) -> TestEvaluator {
        self.evaluator_with(Self::config())
    }

    fn evaluator_with(&self, config: EvaluatorConfig) -> TestEvaluator {
        self.evaluator_over(self.locks.clone(), config)
    }

    fn evaluator_over<L: LockStore>(&self, locks: L, config: EvaluatorConfig) -> TestEvaluator<L> {
        Evaluator::new(
            self.backlog.clone(),
            self.rules.clone(),
            locks,
            self.graph.clone(),
            self.catalog.clone(),
            self.quota.clone(),
        )
        .with_config(config)
        .with_events(self.events.clone())
    }

    fn hooks(&self) -> ChangeHooks<InMemoryBacklog> {
        ChangeHooks::new(self.backlog.clone())
    }

    fn dataset(&self, name: &str, files: usize, bytes: u64) -> (DidKey, Vec<DidKey>) {
        let dataset = did(name);
        self.graph.add_collection(&dataset, DidType::Dataset).unwrap();
        let members: Vec<DidKey> = (0 .. files).map(|i| did(&format!("{name}.file_{i}"))).collect();
        for member in &members {
            self.graph.add_file(member, bytes).unwrap();
            self.graph.attach(&dataset, member).unwrap();
        }
        (dataset, members)
    }

    fn attach_new_file(&self, dataset: &DidKey, name: &str, bytes: u64) -> DidKey {
        let file = did(name);
        self.graph.add_file(&file, bytes).unwrap();
        self.graph.attach(dataset, &file).unwrap();
        assert!(self.hooks().on_attach(dataset, &[file.clone()], &account()).unwrap());
        file
    }

    fn create(&self, spec: &RuleSpec) -> RuleId {
        create_rule(&self.graph, &self.rules, spec).unwrap()
    }

    fn rses_of(&self, file: &DidKey) -> BTreeSet<RseId> {
        list_file_locks(&self.locks, file).unwrap().into_iter().map(|lock| lock.rse_id).collect()
    }
}

/// Lock store that fails every batch while `fail` is set.
#[derive(Clone)]
struct FlakyLocks {
    inner: InMemoryLockStore,
    fail: Arc<AtomicBool>,
}

impl LockStore for FlakyLocks {
    fn file_locks(&self, did: &DidKey) -> Result<Vec<ReplicaLock>, StoreError> {
        self.inner.file_locks(did)
    }

    fn dataset_locks(&self, dataset: &DidKey) -> Result<Vec<DatasetLock>, StoreError> {
        self.inner.dataset_locks(dataset)
    }

    fn rule_locks(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, StoreError> {
        self.inner.rule_locks(rule_id)
    }

    fn rule_dataset_locks(&self, rule_id: RuleId) -> Result<Vec<DatasetLock>, StoreError> {
        self.inner.rule_dataset_locks(rule_id)
    }

    fn apply(&self, batch: &LockBatch) -> Result<LockBatchOutcome, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Store("injected failure".to_string()));
        }
        self.inner.apply(batch)
    }
}

/// Lock store that runs a hook once, before its first batch is applied.
struct HookedLocks {
    inner: InMemoryLockStore,
    hook: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl LockStore for HookedLocks {
    fn file_locks(&self, did: &DidKey) -> Result<Vec<ReplicaLock>, StoreError> {
        self.inner.file_locks(did)
    }

    fn dataset_locks(&self, dataset: &DidKey) -> Result<Vec<DatasetLock>, StoreError> {
        self.inner.dataset_locks(dataset)
    }

    fn rule_locks(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, StoreError> {
        self.inner.rule_locks(rule_id)
    }

    fn rule_dataset_locks(&self, rule_id: RuleId) -> Result<Vec<DatasetLock>, StoreError> {
        self.inner.rule_dataset_locks(rule_id)
    }

    fn apply(&self, batch: &LockBatch) -> Result<LockBatchOutcome, StoreError> {
        let hook = self.hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.apply(batch)
    }
}

// ============================================================================
// SECTION: Grouping
// ============================================================================

#[test]
fn dataset_grouping_keeps_each_dataset_on_shared_resources() {
    let h = Harness::new();
    let container = did("container");
    h.graph.add_collection(&container, DidType::Container).unwrap();
    let (first, first_files) = h.dataset("dataset_1", 3, 100);
    let (second, second_files) = h.dataset("dataset_2", 3, 100);
    h.graph.attach(&container, &first).unwrap();
    h.graph.attach(&container, &second).unwrap();

    let rule_id = h.create(&spec(vec![container], 2, "T1", Grouping::Dataset));
    let report = h.evaluator().run_pass().unwrap();

    assert_eq!(report.swept_rules, 1);
    assert_eq!(report.locks_created, 12);
    for (dataset, files) in [(&first, &first_files), (&second, &second_files)] {
        let expected = h.rses_of(&files[0]);
        assert_eq!(expected.len(), 2);
        assert!(expected.is_subset(&t1_rses()));
        for file in files {
            assert_eq!(h.rses_of(file), expected);
        }
        let aggregates = list_dataset_locks(&h.locks, dataset).unwrap();
        let aggregate_rses: BTreeSet<RseId> =
            aggregates.iter().map(|lock| lock.rse_id.clone()).collect();
        assert_eq!(aggregate_rses, expected);
        for stored in h.locks.dataset_locks(dataset).unwrap() {
            assert_eq!(stored.length, 3);
            assert_eq!(stored.bytes, 300);
            assert_eq!(stored.state, LockState::Replicating);
        }
    }

    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Replicating);
    assert_eq!(rule.counters.replicating, 12);
    assert_eq!(rule.error, None);
}

#[test]
fn all_grouping_places_late_files_next_to_earlier_ones() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 4, 10);
    let rule_id = h.create(&spec(vec![dataset.clone()], 1, "T1", Grouping::All));
    h.evaluator().run_pass().unwrap();
    let placed = h.rses_of(&files[0]);
    assert_eq!(placed.len(), 1);

    let late = h.attach_new_file(&dataset, "late_file", 10);
    let report = h.evaluator_with(EvaluatorConfig {
        selection_seed: Some(99),
        ..Harness::config()
    })
    .run_pass()
    .unwrap();

    assert_eq!(report.processed_dids, 1);
    assert_eq!(report.locks_created, 1);
    assert_eq!(h.rses_of(&late), placed);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap().counters.replicating, 5);
}

#[test]
fn all_grouping_keeps_new_dataset_on_anchor_resource() {
    let h = Harness::new();
    let container = did("container");
    h.graph.add_collection(&container, DidType::Container).unwrap();
    let (first, first_files) = h.dataset("dataset_1", 3, 10);
    for file in &first_files {
        h.graph.add_replica(file, &rse("MOCK3")).unwrap();
    }
    h.graph.attach(&container, &first).unwrap();
    let rule_id = h.create(&spec(vec![container.clone()], 1, "T1", Grouping::All));
    h.evaluator().run_pass().unwrap();
    let anchor: BTreeSet<RseId> = [rse("MOCK3")].into_iter().collect();
    for file in &first_files {
        assert_eq!(h.rses_of(file), anchor);
    }

    let (second, second_files) = h.dataset("dataset_2", 3, 10);
    for file in &second_files {
        h.graph.add_replica(file, &rse("MOCK4")).unwrap();
    }
    h.graph.attach(&container, &second).unwrap();
    assert!(h.hooks().on_attach(&container, &[second], &account()).unwrap());
    let report = h
        .evaluator_with(EvaluatorConfig {
            selection_seed: Some(99),
            ..Harness::config()
        })
        .run_pass()
        .unwrap();

    assert_eq!(report.processed_dids, 1);
    assert_eq!(report.locks_created, 3);
    for file in &second_files {
        assert_eq!(h.rses_of(file), anchor);
    }
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.counters.ok, 3);
    assert_eq!(rule.counters.replicating, 3);
    assert_eq!(rule.state, RuleState::Replicating);
}

#[test]
fn late_file_claimed_directly_joins_its_dataset_unit() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 3, 10);
    for file in &files {
        h.graph.add_replica(file, &rse("MOCK")).unwrap();
    }
    let rule_id = h.create(&spec(vec![dataset.clone()], 1, "T1", Grouping::Dataset));
    h.evaluator().run_pass().unwrap();
    let mock: BTreeSet<RseId> = [rse("MOCK")].into_iter().collect();
    assert_eq!(h.rses_of(&files[0]), mock);

    let late = did("late_file");
    h.graph.add_file(&late, 10).unwrap();
    h.graph.attach(&dataset, &late).unwrap();
    h.graph.add_replica(&late, &rse("MOCK5")).unwrap();
    h.backlog
        .enqueue(&late, replica_judge_core::BacklogAction::Attach, Timestamp::now())
        .unwrap();
    let report = h.evaluator().run_pass().unwrap();

    assert_eq!(report.processed_dids, 1);
    assert_eq!(report.locks_created, 1);
    assert_eq!(h.rses_of(&late), mock);
    let stored = h.locks.dataset_locks(&dataset).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].rse_id, rse("MOCK"));
    assert_eq!(stored[0].length, 4);
    assert_eq!(stored[0].bytes, 40);
    assert_eq!(stored[0].state, LockState::Replicating);
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.counters.ok, 3);
    assert_eq!(rule.counters.replicating, 1);
}

#[test]
fn none_grouping_locks_every_file_independently() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 12, 1);
    h.create(&spec(vec![dataset], 2, "T1", Grouping::None));
    h.evaluator().run_pass().unwrap();

    for file in &files {
        let placed = h.rses_of(file);
        assert_eq!(placed.len(), 2);
        assert!(placed.is_subset(&t1_rses()));
    }
}

#[test]
fn existing_replicas_are_preferred_and_lock_ok() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 3, 50);
    for file in &files {
        h.graph.add_replica(file, &rse("MOCK5")).unwrap();
    }
    let rule_id = h.create(&spec(vec![dataset.clone()], 1, "T1", Grouping::Dataset));
    h.evaluator().run_pass().unwrap();

    for file in &files {
        assert_eq!(h.rses_of(file), [rse("MOCK5")].into_iter().collect());
    }
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Ok);
    assert_eq!(rule.counters.ok, 3);
    let aggregates = list_dataset_locks(&h.locks, &dataset).unwrap();
    assert!(aggregates.iter().all(|lock| lock.state == LockState::Ok));
}

#[test]
fn weight_attribute_excludes_zero_weight_resources_when_possible() {
    let h = Harness::new();
    for (name, weight) in [("MOCK", 0.0), ("MOCK3", 0.0), ("MOCK5", 10.0)] {
        h.catalog
            .upsert(tagged(name, "T1").with_attribute("freespace", AttributeValue::Number(weight)))
            .unwrap();
    }
    let (dataset, files) = h.dataset("dataset", 5, 1);
    let mut weighted = spec(vec![dataset], 1, "T1", Grouping::None);
    weighted.weight = Some("freespace".to_string());
    h.create(&weighted);
    h.evaluator().run_pass().unwrap();

    for file in &files {
        assert_eq!(h.rses_of(file), [rse("MOCK5")].into_iter().collect());
    }
}

// ============================================================================
// SECTION: Stuck Reasons
// ============================================================================

#[test]
fn quota_exhaustion_sticks_and_later_sweep_unsticks() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 2, 100);
    for rse_id in t1_rses() {
        h.quota.set_limit(&account(), &rse_id, 0).unwrap();
    }
    let rule_id = h.create(&spec(vec![dataset], 1, "T1", Grouping::All));
    h.evaluator().run_pass().unwrap();

    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert_eq!(
        rule.error,
        Some(StuckReason::QuotaExceeded {
            rse_ids: t1_rses()
        })
    );
    assert_eq!(h.locks.lock_count().unwrap(), 0);

    h.quota.set_limit(&account(), &rse("MOCK3"), -1).unwrap();
    let report = h.evaluator().run_pass().unwrap();

    assert_eq!(report.swept_rules, 1);
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Replicating);
    assert_eq!(rule.error, None);
    for file in &files {
        assert_eq!(h.rses_of(file), [rse("MOCK3")].into_iter().collect());
    }
}

#[test]
fn quota_is_charged_across_units_within_a_pass() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 3, 100);
    h.quota.set_limit(&account(), &rse("MOCK"), 150).unwrap();
    h.quota.set_limit(&account(), &rse("MOCK3"), 0).unwrap();
    h.quota.set_limit(&account(), &rse("MOCK5"), 0).unwrap();
    let rule_id = h.create(&spec(vec![dataset], 1, "T1", Grouping::None));
    h.evaluator().run_pass().unwrap();

    assert_eq!(h.locks.lock_count().unwrap(), 1);
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert!(matches!(rule.error, Some(StuckReason::QuotaExceeded { .. })));
    let charged: i64 = h.locks.counter_updates().unwrap().iter().map(|delta| delta.bytes).sum();
    assert_eq!(charged, 100);
}

#[test]
fn expression_without_matches_sticks_with_no_matching_resources() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    let rule_id = h.create(&spec(vec![dataset], 1, "T9", Grouping::All));
    h.evaluator().run_pass().unwrap();

    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert_eq!(rule.error, Some(StuckReason::NoMatchingResources));
}

#[test]
fn stored_invalid_expression_sticks_without_locks() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    let rule_id = h
        .rules
        .create_rule(&spec(vec![dataset], 1, "T1&", Grouping::All), Timestamp::now())
        .unwrap();
    h.evaluator().run_pass().unwrap();

    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert!(matches!(rule.error, Some(StuckReason::InvalidExpression { .. })));
    assert_eq!(h.locks.lock_count().unwrap(), 0);
}

#[test]
fn deficit_partially_injects_by_default() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 2, 1);
    let rule_id = h.create(&spec(vec![dataset], 4, "T1", Grouping::Dataset));
    h.evaluator().run_pass().unwrap();

    for file in &files {
        assert_eq!(h.rses_of(file), t1_rses());
    }
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert_eq!(
        rule.error,
        Some(StuckReason::InsufficientResources {
            required: 4,
            available: 3
        })
    );
}

#[test]
fn deficit_reject_policy_locks_nothing() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 2, 1);
    let rule_id = h.create(&spec(vec![dataset], 4, "T1", Grouping::Dataset));
    h.evaluator_with(EvaluatorConfig {
        deficit_policy: DeficitPolicy::Reject,
        ..Harness::config()
    })
    .run_pass()
    .unwrap();

    assert_eq!(h.locks.lock_count().unwrap(), 0);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap().state, RuleState::Stuck);
}

#[test]
fn anchor_leaving_expression_blocks_new_members() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 2, 1);
    let rule_id = h.create(&spec(vec![dataset.clone()], 1, "T1", Grouping::All));
    h.evaluator().run_pass().unwrap();
    let anchor = h.rses_of(&files[0]).into_iter().next().unwrap();

    h.catalog.upsert(Rse::new(anchor.clone())).unwrap();
    let late = h.attach_new_file(&dataset, "late_file", 1);
    h.evaluator().run_pass().unwrap();

    assert!(h.rses_of(&late).is_empty());
    let rule = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert_eq!(
        rule.error,
        Some(StuckReason::AnchorUnsatisfiable {
            rse_ids: [anchor].into_iter().collect()
        })
    );
}

// ============================================================================
// SECTION: Backlog Processing
// ============================================================================

#[test]
fn reprocessing_an_unchanged_identifier_creates_nothing() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 3, 1);
    let rule_id = h.create(&spec(vec![dataset.clone()], 2, "T1", Grouping::Dataset));
    h.evaluator().run_pass().unwrap();
    let before = get_rule(&h.rules, rule_id).unwrap();

    h.backlog
        .enqueue(&dataset, replica_judge_core::BacklogAction::Attach, Timestamp::now())
        .unwrap();
    let report = h.evaluator().run_pass().unwrap();

    assert_eq!(report.processed_dids, 1);
    assert_eq!(report.rules_evaluated, 1);
    assert_eq!(report.locks_created, 0);
    assert_eq!(report.locks_removed, 0);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap(), before);
}

#[test]
fn pass_claims_at_most_did_limit_identifiers() {
    let h = Harness::new();
    let hooks = h.hooks();
    for i in 0 .. 5 {
        let (dataset, files) = h.dataset(&format!("dataset_{i}"), 1, 1);
        hooks.on_attach(&dataset, &files, &account()).unwrap();
    }
    let report = h
        .evaluator_with(EvaluatorConfig {
            did_limit: 2,
            ..Harness::config()
        })
        .run_pass()
        .unwrap();

    assert_eq!(report.claimed_entries, 2);
    assert_eq!(report.processed_dids, 2);
    assert_eq!(h.backlog.pending_count().unwrap(), 3);
}

#[test]
fn detach_removes_locks_of_files_leaving_scope() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 2, 40);
    let rule_id = h.create(&spec(vec![dataset.clone()], 1, "T1", Grouping::All));
    h.evaluator().run_pass().unwrap();
    let placed = h.rses_of(&files[0]);

    h.graph.detach(&dataset, &files[1]).unwrap();
    assert!(h.hooks().on_detach(&dataset, &[files[1].clone()]).unwrap());
    let report = h.evaluator().run_pass().unwrap();

    assert_eq!(report.locks_removed, 1);
    assert!(h.rses_of(&files[1]).is_empty());
    assert_eq!(h.rses_of(&files[0]), placed);
    let stored = h.locks.dataset_locks(&dataset).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].length, 1);
    assert_eq!(stored[0].bytes, 40);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap().counters.replicating, 1);
    let released: i64 = h
        .locks
        .counter_updates()
        .unwrap()
        .iter()
        .filter(|delta| delta.files < 0)
        .map(|delta| delta.bytes)
        .sum();
    assert_eq!(released, -40);
}

#[test]
fn failed_identifier_is_restored_and_retried() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 2, 1);
    let rule_id = h.create(&spec(vec![dataset.clone()], 1, "T1", Grouping::All));
    let fail = Arc::new(AtomicBool::new(false));
    let flaky = FlakyLocks {
        inner: h.locks.clone(),
        fail: Arc::clone(&fail),
    };
    h.evaluator_over(flaky.clone(), Harness::config()).run_pass().unwrap();

    let late = h.attach_new_file(&dataset, "late_file", 1);
    fail.store(true, Ordering::SeqCst);
    let report = h.evaluator_over(flaky.clone(), Harness::config()).run_pass().unwrap();

    assert_eq!(report.deferred_dids, 1);
    assert_eq!(report.failed_rules, 1);
    assert_eq!(h.backlog.pending_count().unwrap(), 1);
    assert!(h.rses_of(&late).is_empty());
    assert!(h.events.labels().contains(&"unit_failed"));

    fail.store(false, Ordering::SeqCst);
    let report = h.evaluator_over(flaky, Harness::config()).run_pass().unwrap();

    assert_eq!(report.processed_dids, 1);
    assert_eq!(h.backlog.pending_count().unwrap(), 0);
    assert_eq!(h.rses_of(&late).len(), 1);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap().counters.replicating, 3);
}

#[test]
fn sweep_is_bounded_and_resumes_after_cursor() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    let mut ids = Vec::new();
    for _ in 0 .. 3 {
        ids.push(h.create(&spec(vec![dataset.clone()], 1, "T9", Grouping::All)));
    }
    let mut evaluator = h.evaluator_with(EvaluatorConfig {
        sweep_limit: 2,
        ..Harness::config()
    });

    assert_eq!(evaluator.run_pass().unwrap().swept_rules, 2);
    assert_eq!(get_rule(&h.rules, ids[2]).unwrap().state, RuleState::Inject);
    assert_eq!(evaluator.run_pass().unwrap().swept_rules, 1);
    assert_eq!(get_rule(&h.rules, ids[2]).unwrap().state, RuleState::Stuck);
}

#[test]
fn run_once_emits_pass_events() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    h.create(&spec(vec![dataset], 1, "T1", Grouping::All));
    let shutdown = AtomicBool::new(false);
    let report = h
        .evaluator()
        .run(
            RunMode {
                once: true,
                did_limit: 10,
            },
            &shutdown,
        )
        .unwrap();

    assert_eq!(report.locks_created, 1);
    let labels = h.events.labels();
    assert_eq!(labels.first(), Some(&"pass_started"));
    assert_eq!(labels.last(), Some(&"pass_finished"));
    assert!(labels.contains(&"unit_committed"));
    assert!(labels.contains(&"rule_evaluated"));
}

#[test]
fn rule_on_empty_container_covers_later_dataset_end_to_end() {
    let h = Harness::new();
    let container = did("container");
    h.graph.add_collection(&container, DidType::Container).unwrap();
    let rule_id = h.create(&spec(vec![container.clone()], 2, "T1", Grouping::Dataset));
    let report = h.evaluator().run_pass().unwrap();
    assert_eq!(report.locks_created, 0);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap().state, RuleState::Ok);

    let (dataset, files) = h.dataset("dataset", 3, 100);
    for file in &files {
        h.graph.add_replica(file, &rse("MOCK")).unwrap();
    }
    h.graph.attach(&container, &dataset).unwrap();
    assert!(h.hooks().on_attach(&container, &[dataset.clone()], &account()).unwrap());
    let report = h.evaluator().run_pass().unwrap();

    assert_eq!(report.locks_created, 6);
    let placed = h.rses_of(&files[0]);
    assert_eq!(placed.len(), 2);
    assert!(placed.contains(&rse("MOCK")));
    assert!(placed.is_subset(&t1_rses()));
    for file in &files {
        assert_eq!(h.rses_of(file), placed);
    }
    let aggregates = h.locks.dataset_locks(&dataset).unwrap();
    assert_eq!(aggregates.len(), 2);
    let aggregate_rses: BTreeSet<RseId> =
        aggregates.iter().map(|lock| lock.rse_id.clone()).collect();
    assert_eq!(aggregate_rses, placed);
    let before = get_rule(&h.rules, rule_id).unwrap();
    assert_eq!(before.counters.ok, 3);
    assert_eq!(before.counters.replicating, 3);

    h.backlog
        .enqueue(&container, replica_judge_core::BacklogAction::Attach, Timestamp::now())
        .unwrap();
    let report = h.evaluator().run_pass().unwrap();
    assert_eq!(report.processed_dids, 1);
    assert_eq!(report.locks_created, 0);
    assert_eq!(report.locks_removed, 0);
    assert_eq!(h.locks.lock_count().unwrap(), 6);
    assert_eq!(get_rule(&h.rules, rule_id).unwrap(), before);
}

// ============================================================================
// SECTION: Concurrent Workers
// ============================================================================

#[test]
fn second_worker_skips_rule_held_by_first() {
    let h = Harness::new();
    let container = did("container");
    h.graph.add_collection(&container, DidType::Container).unwrap();
    let (dataset, files) = h.dataset("dataset", 3, 10);
    h.graph.attach(&container, &dataset).unwrap();
    let rule_id = h.create(&spec(vec![container], 1, "T1", Grouping::All));

    let other_report: Rc<RefCell<Option<PassReport>>> = Rc::new(RefCell::new(None));
    let mut other = h.evaluator_with(EvaluatorConfig {
        worker: WorkerId::new("judge-b"),
        selection_seed: Some(99),
        ..Harness::config()
    });
    let slot = Rc::clone(&other_report);
    let hook: Box<dyn FnOnce()> = Box::new(move || {
        *slot.borrow_mut() = Some(other.run_pass().unwrap());
    });
    let hooked = HookedLocks {
        inner: h.locks.clone(),
        hook: RefCell::new(Some(hook)),
    };
    let report = h
        .evaluator_over(
            hooked,
            EvaluatorConfig {
                worker: WorkerId::new("judge-a"),
                ..Harness::config()
            },
        )
        .run_pass()
        .unwrap();

    let other_report = other_report.borrow_mut().take().unwrap();
    assert_eq!(other_report.busy_rules, 1);
    assert_eq!(other_report.locks_created, 0);
    assert_eq!(report.locks_created, 3);
    assert!(h.events.labels().contains(&"rule_busy"));
    for file in &files {
        assert_eq!(h.rses_of(file).len(), 1);
    }
    let rule = get_rule(&h.rules, rule_id).unwrap();
    let locks = h.locks.rule_locks(rule_id).unwrap();
    assert_eq!(locks.len(), 3);
    assert_eq!(rule.counters.replicating, 3);
    assert_eq!(rule.counters.ok, 0);
    assert_eq!(rule.state, RuleState::Replicating);

    let report = h.evaluator().run_pass().unwrap();
    assert_eq!(report.busy_rules, 0);
    assert_eq!(report.locks_created, 0);
}

#[test]
fn rule_leases_are_exclusive_until_released_or_stale() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    let rule_id = h.create(&spec(vec![dataset], 1, "T1", Grouping::All));
    let now = Timestamp::now();
    let lease = std::time::Duration::from_secs(60);
    let first = replica_judge_core::RuleClaim {
        worker: WorkerId::new("judge-a"),
        now,
        lease,
    };
    let second = replica_judge_core::RuleClaim {
        worker: WorkerId::new("judge-b"),
        now,
        lease,
    };

    assert!(h.rules.claim_rule(rule_id, &first).unwrap());
    assert!(!h.rules.claim_rule(rule_id, &second).unwrap());
    h.rules.release_rule(rule_id, &second).unwrap();
    assert!(!h.rules.claim_rule(rule_id, &second).unwrap());

    let stale = replica_judge_core::RuleClaim {
        now: now.saturating_add(std::time::Duration::from_secs(120)),
        ..second.clone()
    };
    assert!(h.rules.claim_rule(rule_id, &stale).unwrap());
    h.rules.release_rule(rule_id, &stale).unwrap();
    assert!(h.rules.claim_rule(rule_id, &second).unwrap());

    let err = h.evaluator().purge_rule(rule_id).unwrap_err();
    assert!(matches!(err, replica_judge_core::EvaluatorError::RuleBusy(id) if id == rule_id));
    h.rules.release_rule(rule_id, &second).unwrap();
    assert_eq!(h.evaluator().purge_rule(rule_id).unwrap(), 0);
    assert!(!h.rules.claim_rule(rule_id, &first).unwrap());
}

// ============================================================================
// SECTION: Deletion
// ============================================================================

#[test]
fn purge_removes_locks_then_rule() {
    let h = Harness::new();
    let (dataset, files) = h.dataset("dataset", 2, 5);
    let rule_id = h.create(&spec(vec![dataset.clone()], 2, "T1", Grouping::Dataset));
    let evaluator = {
        let mut evaluator = h.evaluator();
        evaluator.run_pass().unwrap();
        evaluator
    };

    assert_eq!(evaluator.purge_rule(rule_id).unwrap(), 4);
    assert!(h.rules.get_rule(rule_id).unwrap().is_none());
    assert!(files.iter().all(|file| h.rses_of(file).is_empty()));
    assert!(h.locks.dataset_locks(&dataset).unwrap().is_empty());
    assert!(h.events.labels().contains(&"rule_purged"));
}

#[test]
fn locked_rule_refuses_purge() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    let mut protected = spec(vec![dataset], 1, "T1", Grouping::All);
    protected.locked = true;
    let rule_id = h.create(&protected);

    let err = h.evaluator().purge_rule(rule_id).unwrap_err();
    assert!(matches!(err, replica_judge_core::EvaluatorError::RuleLocked(id) if id == rule_id));
    assert!(h.rules.get_rule(rule_id).unwrap().is_some());
}

#[test]
fn purge_expired_only_touches_elapsed_rules() {
    let h = Harness::new();
    let (dataset, _) = h.dataset("dataset", 1, 1);
    let mut short = spec(vec![dataset.clone()], 1, "T1", Grouping::All);
    short.lifetime_secs = Some(60);
    let expiring = h.create(&short);
    let permanent = h.create(&spec(vec![dataset], 1, "T1", Grouping::All));
    let mut evaluator = h.evaluator();
    evaluator.run_pass().unwrap();

    let later = Timestamp::now().saturating_add(std::time::Duration::from_secs(3600));
    let report = evaluator.purge_expired(later).unwrap();

    assert_eq!(report.purged_rules, 1);
    assert_eq!(report.locks_removed, 1);
    assert!(h.rules.get_rule(expiring).unwrap().is_none());
    assert!(h.rules.get_rule(permanent).unwrap().is_some());
}
