// crates/replica-judge-core/src/runtime/store.rs
// ============================================================================
// Module: In-Memory Collaborators
// Description: Shared-state implementations of every collaborator interface.
// Purpose: Back tests, single-process deployments, and inventory snapshots.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Each collaborator wraps its state in `Arc<Mutex<_>>` and is cheap to clone;
//! clones share state, so two evaluators built from clones behave like two
//! workers on one database. A poisoned mutex surfaces as a backend error.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::core::AccountCounterDelta;
use crate::core::AccountId;
use crate::core::BacklogAction;
use crate::core::BacklogEntry;
use crate::core::DatasetLock;
use crate::core::DatasetLockKey;
use crate::core::DidKey;
use crate::core::DidRecord;
use crate::core::DidType;
use crate::core::LockBatch;
use crate::core::LockBatchOutcome;
use crate::core::LockKey;
use crate::core::ReplicaLock;
use crate::core::Rse;
use crate::core::RseId;
use crate::core::Rule;
use crate::core::RuleId;
use crate::core::RuleSpec;
use crate::core::RuleState;
use crate::core::RuleStateUpdate;
use crate::core::Timestamp;
use crate::core::WorkerId;
use crate::interfaces::BacklogError;
use crate::interfaces::CatalogError;
use crate::interfaces::ChangeBacklog;
use crate::interfaces::ClaimRequest;
use crate::interfaces::IdentifierGraph;
use crate::interfaces::LockStore;
use crate::interfaces::QuotaAllowance;
use crate::interfaces::QuotaError;
use crate::interfaces::QuotaGate;
use crate::interfaces::ResourceCatalog;
use crate::interfaces::RuleClaim;
use crate::interfaces::RuleStore;
use crate::interfaces::StoreError;

/// Locks a shared state mutex, mapping poison to `err`.
fn guard<'a, T, E>(
    state: &'a Mutex<T>,
    err: impl FnOnce(String) -> E,
    name: &str,
) -> Result<MutexGuard<'a, T>, E> {
    state.lock().map_err(|_| err(format!("{name} mutex poisoned")))
}

// ============================================================================
// SECTION: Change Backlog
// ============================================================================

/// Backlog entry with its claim.
#[derive(Debug, Clone)]
struct StoredEntry {
    /// Entry payload.
    entry: BacklogEntry,
    /// Claiming worker and claim time.
    claim: Option<(WorkerId, Timestamp)>,
}

/// Backlog state.
#[derive(Debug, Default)]
struct BacklogState {
    /// Next entry id.
    next_id: u64,
    /// Entries by id.
    entries: BTreeMap<u64, StoredEntry>,
}

/// In-memory change backlog.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBacklog {
    /// Shared state.
    state: Arc<Mutex<BacklogState>>,
}

impl InMemoryBacklog {
    /// Creates an empty backlog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the backlog state.
    fn lock(&self) -> Result<MutexGuard<'_, BacklogState>, BacklogError> {
        guard(&self.state, BacklogError::Store, "backlog")
    }
}

impl ChangeBacklog for InMemoryBacklog {
    fn enqueue(
        &self,
        did: &DidKey,
        action: BacklogAction,
        now: Timestamp,
    ) -> Result<bool, BacklogError> {
        let mut state = self.lock()?;
        let duplicate = state.entries.values().any(|stored| {
            stored.claim.is_none() && stored.entry.action == action && &stored.entry.did == did
        });
        if duplicate {
            return Ok(false);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.entries.insert(id, StoredEntry {
            entry: BacklogEntry {
                id,
                did: did.clone(),
                action,
                enqueued_at: now,
            },
            claim: None,
        });
        Ok(true)
    }

    fn drain(&self, request: &ClaimRequest) -> Result<Vec<BacklogEntry>, BacklogError> {
        let mut state = self.lock()?;
        let stale_before = request.now.saturating_sub(request.lease);
        let claimable =
            |stored: &StoredEntry| stored.claim.as_ref().is_none_or(|(_, at)| *at <= stale_before);

        let mut dids: Vec<DidKey> = Vec::new();
        for stored in state.entries.values().filter(|stored| claimable(stored)) {
            if dids.len() >= request.limit {
                break;
            }
            if !dids.contains(&stored.entry.did) {
                dids.push(stored.entry.did.clone());
            }
        }

        let mut claimed = Vec::new();
        for stored in state.entries.values_mut() {
            if claimable(stored) && dids.contains(&stored.entry.did) {
                stored.claim = Some((request.worker.clone(), request.now));
                claimed.push(stored.entry.clone());
            }
        }
        Ok(claimed)
    }

    fn acknowledge(&self, ids: &[u64]) -> Result<(), BacklogError> {
        let mut state = self.lock()?;
        for id in ids {
            state.entries.remove(id);
        }
        Ok(())
    }

    fn restore(&self, ids: &[u64]) -> Result<(), BacklogError> {
        let mut state = self.lock()?;
        for id in ids {
            if let Some(stored) = state.entries.get_mut(id) {
                stored.claim = None;
            }
        }
        Ok(())
    }

    fn pending_count(&self) -> Result<u64, BacklogError> {
        let state = self.lock()?;
        let pending = state.entries.values().filter(|stored| stored.claim.is_none()).count();
        Ok(u64::try_from(pending).unwrap_or(u64::MAX))
    }
}

// ============================================================================
// SECTION: Rule Store
// ============================================================================

/// Rule store state.
#[derive(Debug, Default)]
struct RuleTable {
    /// Last assigned rule id.
    last_id: u64,
    /// Rules by id.
    rules: BTreeMap<RuleId, Rule>,
    /// Evaluation leases by rule.
    claims: BTreeMap<RuleId, (WorkerId, Timestamp)>,
}

/// In-memory rule store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuleStore {
    /// Shared state.
    state: Arc<Mutex<RuleTable>>,
}

impl InMemoryRuleStore {
    /// Creates an empty rule store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the rule state.
    fn lock(&self) -> Result<MutexGuard<'_, RuleTable>, StoreError> {
        guard(&self.state, StoreError::Store, "rule store")
    }
}

impl RuleStore for InMemoryRuleStore {
    fn create_rule(&self, spec: &RuleSpec, now: Timestamp) -> Result<RuleId, StoreError> {
        let mut state = self.lock()?;
        let rule_id = RuleId::from_raw(state.last_id.saturating_add(1))
            .ok_or_else(|| StoreError::Store("rule id space exhausted".to_string()))?;
        state.last_id = rule_id.get();
        state.rules.insert(rule_id, Rule::new(rule_id, spec.clone(), now));
        Ok(rule_id)
    }

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<Rule>, StoreError> {
        Ok(self.lock()?.rules.get(&rule_id).cloned())
    }

    fn rules_for_roots(&self, roots: &[DidKey]) -> Result<Vec<Rule>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rules
            .values()
            .filter(|rule| rule.spec.roots.iter().any(|root| roots.contains(root)))
            .cloned()
            .collect())
    }

    fn rules_in_states(
        &self,
        states: &[RuleState],
        after: Option<RuleId>,
        limit: usize,
    ) -> Result<Vec<Rule>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rules
            .values()
            .filter(|rule| after.is_none_or(|after| rule.rule_id > after))
            .filter(|rule| states.contains(&rule.state))
            .take(limit)
            .cloned()
            .collect())
    }

    fn update_rule_state(
        &self,
        rule_id: RuleId,
        update: &RuleStateUpdate,
        _now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let rule = state
            .rules
            .get_mut(&rule_id)
            .ok_or_else(|| StoreError::NotFound(format!("rule {rule_id}")))?;
        rule.state = update.state;
        rule.error.clone_from(&update.error);
        rule.counters = update.counters;
        Ok(())
    }

    fn expired_rules(&self, now: Timestamp, limit: usize) -> Result<Vec<Rule>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rules
            .values()
            .filter(|rule| rule.is_expired(now) && !rule.spec.locked)
            .take(limit)
            .cloned()
            .collect())
    }

    fn claim_rule(&self, rule_id: RuleId, claim: &RuleClaim) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if !state.rules.contains_key(&rule_id) {
            return Ok(false);
        }
        let stale_before = claim.now.saturating_sub(claim.lease);
        if state.claims.get(&rule_id).is_some_and(|(_, at)| *at > stale_before) {
            return Ok(false);
        }
        state.claims.insert(rule_id, (claim.worker.clone(), claim.now));
        Ok(true)
    }

    fn release_rule(&self, rule_id: RuleId, claim: &RuleClaim) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let held = state
            .claims
            .get(&rule_id)
            .is_some_and(|(worker, at)| worker == &claim.worker && *at == claim.now);
        if held {
            state.claims.remove(&rule_id);
        }
        Ok(())
    }

    fn delete_rule(&self, rule_id: RuleId) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.rules.remove(&rule_id);
        state.claims.remove(&rule_id);
        Ok(())
    }
}

// ============================================================================
// SECTION: Lock Store
// ============================================================================

/// Lock table state.
#[derive(Debug, Default)]
struct LockTable {
    /// File locks.
    files: BTreeMap<LockKey, ReplicaLock>,
    /// Dataset aggregates.
    datasets: BTreeMap<DatasetLockKey, DatasetLock>,
    /// Usage deltas recorded for the external aggregator.
    counters: Vec<AccountCounterDelta>,
}

/// In-memory lock store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockStore {
    /// Shared state.
    state: Arc<Mutex<LockTable>>,
}

impl InMemoryLockStore {
    /// Creates an empty lock store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the lock table.
    fn lock(&self) -> Result<MutexGuard<'_, LockTable>, StoreError> {
        guard(&self.state, StoreError::Store, "lock store")
    }

    /// Returns every usage delta recorded so far.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state is poisoned.
    pub fn counter_updates(&self) -> Result<Vec<AccountCounterDelta>, StoreError> {
        Ok(self.lock()?.counters.clone())
    }

    /// Returns the total number of file locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state is poisoned.
    pub fn lock_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.files.len())
    }
}

impl LockStore for InMemoryLockStore {
    fn file_locks(&self, did: &DidKey) -> Result<Vec<ReplicaLock>, StoreError> {
        let state = self.lock()?;
        Ok(state.files.values().filter(|lock| &lock.did == did).cloned().collect())
    }

    fn dataset_locks(&self, dataset: &DidKey) -> Result<Vec<DatasetLock>, StoreError> {
        let state = self.lock()?;
        Ok(state.datasets.values().filter(|lock| &lock.dataset == dataset).cloned().collect())
    }

    fn rule_locks(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, StoreError> {
        let state = self.lock()?;
        Ok(state.files.values().filter(|lock| lock.rule_id == rule_id).cloned().collect())
    }

    fn rule_dataset_locks(&self, rule_id: RuleId) -> Result<Vec<DatasetLock>, StoreError> {
        let state = self.lock()?;
        Ok(state.datasets.values().filter(|lock| lock.rule_id == rule_id).cloned().collect())
    }

    fn apply(&self, batch: &LockBatch) -> Result<LockBatchOutcome, StoreError> {
        let mut state = self.lock()?;
        let mut outcome = LockBatchOutcome::default();
        for key in &batch.remove {
            if let Some(lock) = state.files.remove(key) {
                outcome.removed += 1;
                outcome.record(&lock.account, &lock.rse_id, lock.bytes, -1);
            }
        }
        for lock in &batch.create {
            let key = lock.key();
            if state.files.contains_key(&key) {
                continue;
            }
            outcome.created += 1;
            outcome.record(&lock.account, &lock.rse_id, lock.bytes, 1);
            state.files.insert(key, lock.clone());
        }
        for key in &batch.dataset_removals {
            state.datasets.remove(key);
        }
        for lock in &batch.dataset_upserts {
            state.datasets.insert(lock.key(), lock.clone());
        }
        state.counters.extend(outcome.counters.iter().cloned());
        Ok(outcome)
    }
}

// ============================================================================
// SECTION: Identifier Graph
// ============================================================================

/// Identifier graph state.
#[derive(Debug, Default)]
struct GraphState {
    /// Identifier records.
    dids: BTreeMap<DidKey, DidRecord>,
    /// Children in attach order.
    children: BTreeMap<DidKey, Vec<DidKey>>,
    /// Parents in attach order.
    parents: BTreeMap<DidKey, Vec<DidKey>>,
    /// Physical replica locations of files.
    replicas: BTreeMap<DidKey, BTreeSet<RseId>>,
}

/// In-memory identifier graph with replica locations.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentifierGraph {
    /// Shared state.
    state: Arc<Mutex<GraphState>>,
}

impl InMemoryIdentifierGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the graph state.
    fn lock(&self) -> Result<MutexGuard<'_, GraphState>, CatalogError> {
        guard(&self.state, CatalogError::Backend, "identifier graph")
    }

    /// Registers an identifier, replacing any earlier record.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the state is poisoned.
    pub fn add_did(&self, record: DidRecord) -> Result<(), CatalogError> {
        self.lock()?.dids.insert(record.key.clone(), record);
        Ok(())
    }

    /// Registers a file of `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the state is poisoned.
    pub fn add_file(&self, did: &DidKey, bytes: u64) -> Result<(), CatalogError> {
        self.add_did(DidRecord {
            key: did.clone(),
            did_type: DidType::File,
            bytes,
        })
    }

    /// Registers a collection of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the state is poisoned.
    pub fn add_collection(&self, did: &DidKey, did_type: DidType) -> Result<(), CatalogError> {
        self.add_did(DidRecord {
            key: did.clone(),
            did_type,
            bytes: 0,
        })
    }

    /// Attaches `child` below `parent`. Re-attaching is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownDid`] for unregistered identifiers and
    /// [`CatalogError::InvalidAttachment`] when the types do not nest.
    pub fn attach(&self, parent: &DidKey, child: &DidKey) -> Result<(), CatalogError> {
        let mut state = self.lock()?;
        let parent_type = state
            .dids
            .get(parent)
            .map(|record| record.did_type)
            .ok_or_else(|| CatalogError::UnknownDid(parent.clone()))?;
        let child_type = state
            .dids
            .get(child)
            .map(|record| record.did_type)
            .ok_or_else(|| CatalogError::UnknownDid(child.clone()))?;
        if !parent_type.accepts_child(child_type) {
            return Err(CatalogError::InvalidAttachment {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        let children = state.children.entry(parent.clone()).or_default();
        if children.contains(child) {
            return Ok(());
        }
        children.push(child.clone());
        state.parents.entry(child.clone()).or_default().push(parent.clone());
        Ok(())
    }

    /// Detaches `child` from `parent`. Missing edges are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the state is poisoned.
    pub fn detach(&self, parent: &DidKey, child: &DidKey) -> Result<(), CatalogError> {
        let mut state = self.lock()?;
        if let Some(children) = state.children.get_mut(parent) {
            children.retain(|existing| existing != child);
        }
        if let Some(parents) = state.parents.get_mut(child) {
            parents.retain(|existing| existing != parent);
        }
        Ok(())
    }

    /// Records a physical replica of a file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the state is poisoned.
    pub fn add_replica(&self, did: &DidKey, rse_id: &RseId) -> Result<(), CatalogError> {
        self.lock()?.replicas.entry(did.clone()).or_default().insert(rse_id.clone());
        Ok(())
    }
}

impl IdentifierGraph for InMemoryIdentifierGraph {
    fn did(&self, did: &DidKey) -> Result<Option<DidRecord>, CatalogError> {
        Ok(self.lock()?.dids.get(did).cloned())
    }

    fn children(&self, did: &DidKey) -> Result<Vec<DidKey>, CatalogError> {
        Ok(self.lock()?.children.get(did).cloned().unwrap_or_default())
    }

    fn parents(&self, did: &DidKey) -> Result<Vec<DidKey>, CatalogError> {
        Ok(self.lock()?.parents.get(did).cloned().unwrap_or_default())
    }

    fn replica_rses(&self, did: &DidKey) -> Result<Vec<RseId>, CatalogError> {
        Ok(self
            .lock()?
            .replicas
            .get(did)
            .map(|rses| rses.iter().cloned().collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// SECTION: Resource Catalog
// ============================================================================

/// In-memory resource catalog.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResourceCatalog {
    /// Resources in registration order.
    state: Arc<Mutex<Vec<Rse>>>,
}

impl InMemoryResourceCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource or replaces the one with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the state is poisoned.
    pub fn upsert(&self, rse: Rse) -> Result<(), CatalogError> {
        let mut rses = guard(&self.state, CatalogError::Backend, "resource catalog")?;
        if let Some(existing) = rses.iter_mut().find(|existing| existing.id == rse.id) {
            *existing = rse;
        } else {
            rses.push(rse);
        }
        Ok(())
    }
}

impl ResourceCatalog for InMemoryResourceCatalog {
    fn list_rses(&self) -> Result<Vec<Rse>, CatalogError> {
        Ok(guard(&self.state, CatalogError::Backend, "resource catalog")?.clone())
    }
}

// ============================================================================
// SECTION: Quota Gate
// ============================================================================

/// Quota state.
#[derive(Debug)]
struct QuotaState {
    /// Limit used when no explicit limit is set; negative means unlimited.
    default_limit: i64,
    /// Explicit byte limits; negative means unlimited.
    limits: BTreeMap<(AccountId, RseId), i64>,
    /// Bytes in use.
    usage: BTreeMap<(AccountId, RseId), u64>,
}

/// In-memory quota gate with byte limits and usage.
#[derive(Debug, Clone)]
pub struct InMemoryQuotaGate {
    /// Shared state.
    state: Arc<Mutex<QuotaState>>,
}

impl Default for InMemoryQuotaGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuotaGate {
    /// Creates a gate where every account is unlimited.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_limit(-1)
    }

    /// Creates a gate applying `limit_bytes` wherever no limit is set.
    #[must_use]
    pub fn with_default_limit(limit_bytes: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(QuotaState {
                default_limit: limit_bytes,
                limits: BTreeMap::new(),
                usage: BTreeMap::new(),
            })),
        }
    }

    /// Locks the quota state.
    fn lock(&self) -> Result<MutexGuard<'_, QuotaState>, QuotaError> {
        guard(&self.state, QuotaError::Backend, "quota gate")
    }

    /// Sets the byte limit of `account` at `rse_id`; `-1` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError`] when the state is poisoned.
    pub fn set_limit(
        &self,
        account: &AccountId,
        rse_id: &RseId,
        limit_bytes: i64,
    ) -> Result<(), QuotaError> {
        self.lock()?.limits.insert((account.clone(), rse_id.clone()), limit_bytes);
        Ok(())
    }

    /// Sets the bytes in use by `account` at `rse_id`.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError`] when the state is poisoned.
    pub fn set_usage(
        &self,
        account: &AccountId,
        rse_id: &RseId,
        used_bytes: u64,
    ) -> Result<(), QuotaError> {
        self.lock()?.usage.insert((account.clone(), rse_id.clone()), used_bytes);
        Ok(())
    }
}

impl QuotaGate for InMemoryQuotaGate {
    fn allowance(
        &self,
        account: &AccountId,
        rse_id: &RseId,
    ) -> Result<QuotaAllowance, QuotaError> {
        let state = self.lock()?;
        let key = (account.clone(), rse_id.clone());
        let limit = state.limits.get(&key).copied().unwrap_or(state.default_limit);
        let used = state.usage.get(&key).copied().unwrap_or(0);
        Ok(QuotaAllowance::from_limit(limit, used))
    }
}
