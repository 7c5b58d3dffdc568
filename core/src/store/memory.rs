//! In-memory ledger store with optimistic concurrency.
//!
//! Each attempt starts from the committed state at some version, runs
//! the unit against a private copy-on-write handle, then commits only if
//! no other unit committed in between. On a version mismatch the copy is discarded
//! and the unit re-runs from a fresh snapshot. Units that wrote nothing
//! never conflict.

use super::{LedgerStore, LedgerTx};
use crate::{
    config::StoreConfig,
    error::{WalletError, WalletResult},
    event::EventLogEntry,
    models::{
        DistributionStatus, LedgerTransaction, PaymentDistribution, RechargeRequest,
        RechargeStatus, WalletAccount,
    },
    types::Timestamp,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    accounts: BTreeMap<String, WalletAccount>,
    // Vecs keep insertion order, which breaks timestamp ties.
    recharges: Vec<RechargeRequest>,
    transactions: Vec<LedgerTransaction>,
    distributions: Vec<PaymentDistribution>,
    events: Vec<EventLogEntry>,
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    state: Arc<LedgerState>,
}

pub struct MemoryLedgerStore {
    committed: Mutex<Committed>,
    config: StoreConfig,
}

impl MemoryLedgerStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            committed: Mutex::new(Committed::default()),
            config,
        }
    }

    /// Number of units committed so far.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    fn lock(&self) -> MutexGuard<'_, Committed> {
        // Commits swap the state in a single assignment, so a poisoned
        // lock still guards a consistent snapshot.
        self.committed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> (u64, Arc<LedgerState>) {
        let committed = self.lock();
        (committed.version, Arc::clone(&committed.state))
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn run_atomic<T, F>(&self, mut op: F) -> WalletResult<T>
    where
        F: FnMut(&mut dyn LedgerTx) -> WalletResult<T>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let (version, state) = self.snapshot();
            let mut tx = MemoryTx {
                state,
                dirty: false,
            };
            let value = op(&mut tx)?;
            if !tx.dirty {
                return Ok(value);
            }

            let mut committed = self.lock();
            if committed.version == version {
                committed.version += 1;
                committed.state = tx.state;
                return Ok(value);
            }
            drop(committed);

            log::debug!(
                "ledger snapshot v{version} went stale (attempt {attempt}/{max_attempts}), retrying"
            );
            std::thread::sleep(self.config.backoff(attempt));
        }
        Err(WalletError::ConcurrentModification {
            attempts: max_attempts,
        })
    }

    fn read_only<T, F>(&self, mut op: F) -> WalletResult<T>
    where
        F: FnMut(&dyn LedgerTx) -> WalletResult<T>,
    {
        let (_, state) = self.snapshot();
        op(&MemoryTx {
            state,
            dirty: false,
        })
    }
}

/// Reads go straight to the shared snapshot; the first write clones it.
struct MemoryTx {
    state: Arc<LedgerState>,
    dirty: bool,
}

fn newest_first<T: Clone>(items: &[T], limit: Option<usize>) -> Vec<T> {
    items
        .iter()
        .rev()
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

impl MemoryTx {
    fn state_mut(&mut self) -> &mut LedgerState {
        self.dirty = true;
        Arc::make_mut(&mut self.state)
    }

    fn transactions_newest_first(
        &self,
        filter: impl Fn(&LedgerTransaction) -> bool,
    ) -> Vec<LedgerTransaction> {
        let mut rows: Vec<&LedgerTransaction> =
            self.state.transactions.iter().filter(|t| filter(*t)).collect();
        // Stable sort keeps append order among equal timestamps.
        rows.sort_by_key(|t| t.created_at);
        rows.into_iter().rev().cloned().collect()
    }

    fn recharges_newest_first(&self, filter: impl Fn(&RechargeRequest) -> bool) -> Vec<RechargeRequest> {
        let mut rows: Vec<&RechargeRequest> =
            self.state.recharges.iter().filter(|r| filter(*r)).collect();
        rows.sort_by_key(|r| r.requested_at);
        rows.into_iter().rev().cloned().collect()
    }
}

impl LedgerTx for MemoryTx {
    // ── Accounts ───────────────────────────────────────────────

    fn account(&self, user_id: &str) -> WalletResult<Option<WalletAccount>> {
        Ok(self.state.accounts.get(user_id).cloned())
    }

    fn insert_account(&mut self, account: &WalletAccount) -> WalletResult<bool> {
        if self.state.accounts.contains_key(&account.user_id) {
            return Ok(false);
        }
        self.state_mut()
            .accounts
            .insert(account.user_id.clone(), account.clone());
        Ok(true)
    }

    fn save_account(&mut self, account: &WalletAccount) -> WalletResult<()> {
        let created_at = self
            .state
            .accounts
            .get(&account.user_id)
            .map_or(account.created_at, |existing| existing.created_at);
        let mut row = account.clone();
        row.created_at = created_at;
        self.state_mut().accounts.insert(row.user_id.clone(), row);
        Ok(())
    }

    // ── Recharge requests ──────────────────────────────────────

    fn recharge(&self, recharge_id: &str) -> WalletResult<Option<RechargeRequest>> {
        Ok(self
            .state
            .recharges
            .iter()
            .find(|r| r.id == recharge_id)
            .cloned())
    }

    fn insert_recharge(&mut self, recharge: &RechargeRequest) -> WalletResult<()> {
        self.state_mut().recharges.push(recharge.clone());
        Ok(())
    }

    fn update_recharge(&mut self, recharge: &RechargeRequest) -> WalletResult<()> {
        if let Some(idx) = self.state.recharges.iter().position(|r| r.id == recharge.id) {
            self.state_mut().recharges[idx] = recharge.clone();
        }
        Ok(())
    }

    fn recharges_with_status(&self, status: RechargeStatus) -> WalletResult<Vec<RechargeRequest>> {
        Ok(self.recharges_newest_first(|r| r.status == status))
    }

    fn user_recharges(&self, user_id: &str) -> WalletResult<Vec<RechargeRequest>> {
        Ok(self.recharges_newest_first(|r| r.user_id == user_id))
    }

    // ── Ledger transactions ────────────────────────────────────

    fn append_transaction(&mut self, tx: &LedgerTransaction) -> WalletResult<()> {
        self.state_mut().transactions.push(tx.clone());
        Ok(())
    }

    fn user_transactions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> WalletResult<Vec<LedgerTransaction>> {
        let mut rows = self.transactions_newest_first(|t| t.user_id == user_id);
        rows.truncate(limit.unwrap_or(usize::MAX));
        Ok(rows)
    }

    fn all_transactions(&self, limit: Option<usize>) -> WalletResult<Vec<LedgerTransaction>> {
        let mut rows = self.transactions_newest_first(|_| true);
        rows.truncate(limit.unwrap_or(usize::MAX));
        Ok(rows)
    }

    fn user_transaction_count(&self, user_id: &str) -> WalletResult<u64> {
        Ok(self
            .state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .count() as u64)
    }

    // ── Payment distributions ──────────────────────────────────

    fn distribution(&self, distribution_id: &str) -> WalletResult<Option<PaymentDistribution>> {
        Ok(self
            .state
            .distributions
            .iter()
            .find(|d| d.id == distribution_id)
            .cloned())
    }

    fn insert_distribution(&mut self, distribution: &PaymentDistribution) -> WalletResult<()> {
        self.state_mut().distributions.push(distribution.clone());
        Ok(())
    }

    fn update_distribution(&mut self, distribution: &PaymentDistribution) -> WalletResult<()> {
        if let Some(idx) = self
            .state
            .distributions
            .iter()
            .position(|d| d.id == distribution.id)
        {
            self.state_mut().distributions[idx] = distribution.clone();
        }
        Ok(())
    }

    fn distributions_due(
        &self,
        status: DistributionStatus,
        until: Timestamp,
    ) -> WalletResult<Vec<PaymentDistribution>> {
        let mut rows: Vec<PaymentDistribution> = self
            .state
            .distributions
            .iter()
            .filter(|d| d.status == status && d.scheduled_for <= until)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.scheduled_for);
        Ok(rows)
    }

    fn kommuter_distributions(&self, kommuter_id: &str) -> WalletResult<Vec<PaymentDistribution>> {
        let mut rows: Vec<&PaymentDistribution> = self
            .state
            .distributions
            .iter()
            .filter(|d| d.kommuter_id == kommuter_id)
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows.into_iter().rev().cloned().collect())
    }

    // ── Event log ──────────────────────────────────────────────

    fn append_event(&mut self, entry: &EventLogEntry) -> WalletResult<()> {
        let mut row = entry.clone();
        row.id = Some(self.state.events.len() as i64 + 1);
        self.state_mut().events.push(row);
        Ok(())
    }

    fn recent_events(&self, limit: usize) -> WalletResult<Vec<EventLogEntry>> {
        Ok(newest_first(&self.state.events, Some(limit)))
    }
}
