// crates/replica-judge-store-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Judge Store Tests
// Description: Persistence, claim isolation, and evaluator integration.
// ============================================================================
//! ## Overview
//! Runs the backlog, rule, and lock interfaces against a temporary database,
//! including two store handles sharing one file the way separate workers do.

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

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use replica_judge_core::AccountId;
use replica_judge_core::AttributeValue;
use replica_judge_core::BacklogAction;
use replica_judge_core::ChangeBacklog;
use replica_judge_core::ChangeHooks;
use replica_judge_core::ClaimRequest;
use replica_judge_core::DatasetLock;
use replica_judge_core::DidKey;
use replica_judge_core::DidType;
use replica_judge_core::Evaluator;
use replica_judge_core::EvaluatorConfig;
use replica_judge_core::Grouping;
use replica_judge_core::InMemoryIdentifierGraph;
use replica_judge_core::InMemoryQuotaGate;
use replica_judge_core::InMemoryResourceCatalog;
use replica_judge_core::LockBatch;
use replica_judge_core::LockCounters;
use replica_judge_core::LockKey;
use replica_judge_core::LockState;
use replica_judge_core::LockStore;
use replica_judge_core::ReplicaLock;
use replica_judge_core::RetryPolicy;
use replica_judge_core::Rse;
use replica_judge_core::RseId;
use replica_judge_core::RuleClaim;
use replica_judge_core::RuleId;
use replica_judge_core::RuleSpec;
use replica_judge_core::RuleState;
use replica_judge_core::RuleStateUpdate;
use replica_judge_core::RuleStore;
use replica_judge_core::StoreError;
use replica_judge_core::StuckReason;
use replica_judge_core::Timestamp;
use replica_judge_core::WorkerId;
use replica_judge_core::create_rule;
use replica_judge_store_sqlite::SqliteJudgeStore;
use replica_judge_store_sqlite::SqliteStoreConfig;
use replica_judge_store_sqlite::SqliteStoreError;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn open(path: &Path) -> SqliteJudgeStore {
    SqliteJudgeStore::open(&SqliteStoreConfig::new(path)).unwrap()
}

fn did(name: &str) -> DidKey {
    DidKey::new("data18", name)
}

fn t(seconds: u64) -> Timestamp {
    Timestamp::from_millis(1_700_000_000_000 + seconds * 1000)
}

fn claim(worker: &str, limit: usize, now: Timestamp) -> ClaimRequest {
    ClaimRequest {
        worker: WorkerId::new(worker),
        limit,
        now,
        lease: Duration::from_secs(600),
    }
}

fn spec(roots: Vec<DidKey>) -> RuleSpec {
    RuleSpec {
        roots,
        account: AccountId::new("jdoe"),
        copies: 2,
        rse_expression: "T1".to_string(),
        grouping: Grouping::Dataset,
        weight: None,
        lifetime_secs: None,
        locked: false,
        subscription_id: None,
    }
}

fn lock(name: &str, rse: &str, rule_id: RuleId, bytes: u64) -> ReplicaLock {
    ReplicaLock {
        did: did(name),
        rse_id: RseId::new(rse),
        rule_id,
        account: AccountId::new("jdoe"),
        state: LockState::Replicating,
        bytes,
        created_at: t(0),
    }
}

// ============================================================================
// SECTION: Backlog
// ============================================================================

#[test]
fn two_handles_claim_disjoint_identifiers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judge.sqlite");
    let first = open(&path);
    let second = open(&path);
    for name in ["a", "b", "c"] {
        first.enqueue(&did(name), BacklogAction::Attach, t(0)).unwrap();
    }
    first.enqueue(&did("a"), BacklogAction::Detach, t(1)).unwrap();

    let one = first.drain(&claim("worker-1", 2, t(2))).unwrap();
    let two = second.drain(&claim("worker-2", 10, t(2))).unwrap();

    let one_dids: BTreeSet<DidKey> = one.iter().map(|entry| entry.did.clone()).collect();
    let two_dids: BTreeSet<DidKey> = two.iter().map(|entry| entry.did.clone()).collect();
    assert_eq!(one.len(), 3);
    assert_eq!(one_dids, [did("a"), did("b")].into_iter().collect());
    assert_eq!(two_dids, [did("c")].into_iter().collect());
    assert_eq!(first.pending_count().unwrap(), 0);
}

#[test]
fn duplicates_collapse_and_stale_claims_are_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("judge.sqlite"));
    assert!(store.enqueue(&did("a"), BacklogAction::Attach, t(0)).unwrap());
    assert!(!store.enqueue(&did("a"), BacklogAction::Attach, t(1)).unwrap());

    let crashed = store.drain(&claim("worker-1", 10, t(2))).unwrap();
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].enqueued_at, t(0));
    assert!(store.drain(&claim("worker-2", 10, t(60))).unwrap().is_empty());

    let reclaimed = store.drain(&claim("worker-2", 10, t(602))).unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, crashed[0].id);

    store.restore(&[reclaimed[0].id]).unwrap();
    assert_eq!(store.pending_count().unwrap(), 1);
    let again = store.drain(&claim("worker-2", 10, t(603))).unwrap();
    store.acknowledge(&[again[0].id]).unwrap();
    assert_eq!(store.pending_count().unwrap(), 0);
    assert!(store.drain(&claim("worker-2", 10, t(100_000))).unwrap().is_empty());
}

// ============================================================================
// SECTION: Rules
// ============================================================================

#[test]
fn rules_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judge.sqlite");
    let rule_id = {
        let store = open(&path);
        let mut request = spec(vec![did("dataset"), did("other")]);
        request.lifetime_secs = Some(60);
        let rule_id = store.create_rule(&request, t(0)).unwrap();
        store
            .update_rule_state(
                rule_id,
                &RuleStateUpdate {
                    state: RuleState::Stuck,
                    error: Some(StuckReason::InsufficientResources {
                        required: 2,
                        available: 1,
                    }),
                    counters: LockCounters {
                        ok: 1,
                        replicating: 0,
                        stuck: 1,
                    },
                },
                t(5),
            )
            .unwrap();
        rule_id
    };

    let store = open(&path);
    let rule = store.get_rule(rule_id).unwrap().unwrap();
    assert_eq!(rule.state, RuleState::Stuck);
    assert_eq!(rule.spec.roots, vec![did("dataset"), did("other")]);
    assert_eq!(
        rule.error,
        Some(StuckReason::InsufficientResources {
            required: 2,
            available: 1
        })
    );
    assert_eq!(rule.counters.stuck, 1);
    assert_eq!(rule.created_at, t(0));
    assert_eq!(rule.expires_at, Some(t(60)));

    assert_eq!(store.rules_for_roots(&[did("other")]).unwrap().len(), 1);
    assert!(store.rules_for_roots(&[did("unrelated")]).unwrap().is_empty());
    assert_eq!(store.expired_rules(t(59), 10).unwrap().len(), 0);
    assert_eq!(store.expired_rules(t(60), 10).unwrap().len(), 1);
}

#[test]
fn state_scan_pages_by_rule_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("judge.sqlite"));
    let ids: Vec<RuleId> = (0 .. 3)
        .map(|i| store.create_rule(&spec(vec![did(&format!("ds{i}"))]), t(0)).unwrap())
        .collect();
    let ok = RuleStateUpdate {
        state: RuleState::Ok,
        error: None,
        counters: LockCounters::default(),
    };
    store.update_rule_state(ids[1], &ok, t(1)).unwrap();

    let page = store.rules_in_states(&[RuleState::Inject, RuleState::Stuck], None, 1).unwrap();
    assert_eq!(page.iter().map(|rule| rule.rule_id).collect::<Vec<_>>(), vec![ids[0]]);
    let rest =
        store.rules_in_states(&[RuleState::Inject, RuleState::Stuck], Some(ids[0]), 10).unwrap();
    assert_eq!(rest.iter().map(|rule| rule.rule_id).collect::<Vec<_>>(), vec![ids[2]]);
}

#[test]
fn missing_rules_report_not_found_and_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("judge.sqlite"));
    let rule_id = store.create_rule(&spec(vec![did("dataset")]), t(0)).unwrap();
    store.delete_rule(rule_id).unwrap();
    store.delete_rule(rule_id).unwrap();

    assert!(store.get_rule(rule_id).unwrap().is_none());
    assert!(store.rules_for_roots(&[did("dataset")]).unwrap().is_empty());
    let update = RuleStateUpdate {
        state: RuleState::Ok,
        error: None,
        counters: LockCounters::default(),
    };
    let missing = store.update_rule_state(rule_id, &update, t(1));
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[test]
fn rule_leases_are_shared_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judge.sqlite");
    let first = open(&path);
    let second = open(&path);
    let rule_id = first.create_rule(&spec(vec![did("dataset")]), t(0)).unwrap();
    let lease = Duration::from_secs(60);
    let held = RuleClaim {
        worker: WorkerId::new("worker-1"),
        now: t(1),
        lease,
    };
    let other = RuleClaim {
        worker: WorkerId::new("worker-2"),
        now: t(2),
        lease,
    };

    assert!(first.claim_rule(rule_id, &held).unwrap());
    assert!(!second.claim_rule(rule_id, &other).unwrap());
    second.release_rule(rule_id, &other).unwrap();
    assert!(!second.claim_rule(rule_id, &other).unwrap());

    first.release_rule(rule_id, &held).unwrap();
    assert!(second.claim_rule(rule_id, &other).unwrap());

    let late = RuleClaim {
        now: t(120),
        ..held.clone()
    };
    assert!(first.claim_rule(rule_id, &late).unwrap());

    first.delete_rule(rule_id).unwrap();
    assert!(!second.claim_rule(rule_id, &other).unwrap());
}

// ============================================================================
// SECTION: Locks
// ============================================================================

#[test]
fn lock_batches_are_idempotent_and_record_counters() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("judge.sqlite"));
    let rule_id = store.create_rule(&spec(vec![did("dataset")]), t(0)).unwrap();

    let mut batch = LockBatch::new(rule_id);
    batch.create = vec![lock("f1", "MOCK", rule_id, 10), lock("f2", "MOCK", rule_id, 30)];
    batch.dataset_upserts = vec![DatasetLock {
        dataset: did("dataset"),
        rse_id: RseId::new("MOCK"),
        rule_id,
        account: AccountId::new("jdoe"),
        state: LockState::Replicating,
        length: 2,
        bytes: 40,
        updated_at: t(0),
    }];
    let first = store.apply(&batch).unwrap();
    let second = store.apply(&batch).unwrap();

    assert_eq!(first.created, 2);
    assert_eq!(second.created, 0);
    assert_eq!(store.lock_count().unwrap(), 2);
    assert_eq!(store.file_locks(&did("f1")).unwrap()[0].bytes, 10);
    assert_eq!(store.rule_dataset_locks(rule_id).unwrap().len(), 1);

    let mut removal = LockBatch::new(rule_id);
    removal.remove = vec![LockKey {
        did: did("f2"),
        rse_id: RseId::new("MOCK"),
        rule_id,
    }];
    let removed = store.apply(&removal).unwrap();
    assert_eq!(removed.removed, 1);

    let bytes: i64 = store.counter_updates().unwrap().iter().map(|delta| delta.bytes).sum();
    let files: i64 = store.counter_updates().unwrap().iter().map(|delta| delta.files).sum();
    assert_eq!(bytes, 10);
    assert_eq!(files, 1);
    assert_eq!(store.rule_locks(rule_id).unwrap().len(), 1);
}

// ============================================================================
// SECTION: Open and Schema
// ============================================================================

#[test]
fn directory_paths_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let result = SqliteJudgeStore::open(&SqliteStoreConfig::new(dir.path()));
    assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
}

#[test]
fn unknown_schema_versions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judge.sqlite");
    drop(open(&path));
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", []).unwrap();
    drop(connection);

    assert!(matches!(
        SqliteJudgeStore::open(&SqliteStoreConfig::new(&path)),
        Err(SqliteStoreError::VersionMismatch(_))
    ));
}

#[test]
fn corrupt_rule_rows_fail_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("judge.sqlite");
    let store = open(&path);
    let rule_id = store.create_rule(&spec(vec![did("dataset")]), t(0)).unwrap();
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection.execute("UPDATE rules SET state = 'BOGUS'", []).unwrap();
    drop(connection);

    assert!(matches!(store.get_rule(rule_id), Err(StoreError::Corrupt(_))));
}

// ============================================================================
// SECTION: Evaluator Integration
// ============================================================================

#[test]
fn evaluator_places_locks_through_the_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("judge.sqlite"));
    let graph = InMemoryIdentifierGraph::new();
    let catalog = InMemoryResourceCatalog::new();
    for name in ["MOCK", "MOCK3", "MOCK5"] {
        catalog.upsert(Rse::new(name).with_attribute("T1", AttributeValue::Bool(true))).unwrap();
    }
    let dataset = did("dataset");
    graph.add_collection(&dataset, DidType::Dataset).unwrap();
    let files = [did("f1"), did("f2")];
    for file in &files {
        graph.add_file(file, 100).unwrap();
        graph.attach(&dataset, file).unwrap();
    }
    let rule_id = create_rule(&graph, &store, &spec(vec![dataset.clone()])).unwrap();
    ChangeHooks::new(store.clone())
        .on_attach(&dataset, &files, &AccountId::new("root"))
        .unwrap();

    let mut evaluator = Evaluator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        graph,
        catalog,
        InMemoryQuotaGate::new(),
    )
    .with_config(EvaluatorConfig {
        retry: RetryPolicy::none(),
        selection_seed: Some(11),
        ..EvaluatorConfig::default()
    });
    let report = evaluator.run_pass().unwrap();

    assert_eq!(report.locks_created, 4);
    assert_eq!(store.lock_count().unwrap(), 4);
    let rule = store.get_rule(rule_id).unwrap().unwrap();
    assert_eq!(rule.state, RuleState::Replicating);
    assert_eq!(rule.counters.replicating, 4);

    let placed: BTreeSet<RseId> =
        store.file_locks(&files[0]).unwrap().into_iter().map(|lock| lock.rse_id).collect();
    let sibling: BTreeSet<RseId> =
        store.file_locks(&files[1]).unwrap().into_iter().map(|lock| lock.rse_id).collect();
    assert_eq!(placed, sibling);
    assert_eq!(store.pending_count().unwrap(), 0);

    let again = evaluator.run_pass().unwrap();
    assert_eq!(again.locks_created, 0);
}
