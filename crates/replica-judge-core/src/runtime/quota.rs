// crates/replica-judge-core/src/runtime/quota.rs
// ============================================================================
// Module: Quota Ledger
// Description: Per-pass view of account allowances and uncommitted debits.
// Purpose: Keep several units in one pass from overspending the same
//          allowance before the external usage aggregator catches up.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! The ledger caches the gate's allowance per `(account, resource)` for the
//! duration of a pass and adds the bytes committed by earlier units. It is
//! dropped at the end of the pass so the next pass re-reads the gate, which is
//! how a raised quota un-sticks a rule.

use std::collections::BTreeMap;

use crate::core::AccountId;
use crate::core::RseId;
use crate::interfaces::QuotaAllowance;
use crate::interfaces::QuotaError;
use crate::interfaces::QuotaGate;

/// Pass-scoped quota bookkeeping.
#[derive(Debug, Default)]
pub struct QuotaLedger {
    /// Cached allowance and bytes debited this pass.
    entries: BTreeMap<(AccountId, RseId), (QuotaAllowance, u64)>,
}

impl QuotaLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `bytes` more may be charged to `account` at `rse_id`.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError`] when the gate cannot be consulted.
    pub fn admits(
        &mut self,
        gate: &impl QuotaGate,
        account: &AccountId,
        rse_id: &RseId,
        bytes: u64,
    ) -> Result<bool, QuotaError> {
        let key = (account.clone(), rse_id.clone());
        let (allowance, debited) = match self.entries.get(&key) {
            Some(entry) => *entry,
            None => {
                let allowance = gate.allowance(account, rse_id)?;
                self.entries.insert(key, (allowance, 0));
                (allowance, 0)
            }
        };
        Ok(allowance.covers(debited.saturating_add(bytes)))
    }

    /// Records bytes committed for `account` at `rse_id`.
    pub fn debit(&mut self, account: &AccountId, rse_id: &RseId, bytes: u64) {
        let entry = self
            .entries
            .entry((account.clone(), rse_id.clone()))
            .or_insert((QuotaAllowance::Unlimited, 0));
        entry.1 = entry.1.saturating_add(bytes);
    }
}
