//! Ledger persistence layer.
//!
//! RULE: Only the store talks to storage.
//! Components describe what they read and write through [`LedgerTx`];
//! every unit of work goes through [`LedgerStore::run_atomic`].
//!
//! `run_atomic` takes an `FnMut` because a store may run it more than
//! once: when a concurrent commit invalidates the snapshot an attempt
//! read from, the attempt is discarded and the whole closure runs again
//! against fresh state. Closures must therefore make every decision from
//! what they read through the transaction, never from captured state
//! they mutate.

mod memory;
mod sqlite;

pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;

use crate::{
    error::WalletResult,
    event::EventLogEntry,
    models::{
        DistributionStatus, LedgerTransaction, PaymentDistribution, RechargeRequest,
        RechargeStatus, WalletAccount,
    },
    types::Timestamp,
};

/// A transactional storage backend.
pub trait LedgerStore: Send + Sync {
    /// Run `op` as one serializable unit. Either every write `op` made is
    /// committed, or none is. Conflicts with concurrent units are retried
    /// internally; an `Err` returned by `op` aborts without retrying.
    fn run_atomic<T, F>(&self, op: F) -> WalletResult<T>
    where
        F: FnMut(&mut dyn LedgerTx) -> WalletResult<T>;

    /// Run `op` against one consistent snapshot without taking the write
    /// lock. Concurrent writers neither block nor invalidate the read.
    fn read_only<T, F>(&self, op: F) -> WalletResult<T>
    where
        F: FnMut(&dyn LedgerTx) -> WalletResult<T>;
}

/// Reads and writes visible inside one atomic unit.
///
/// List methods return newest first unless documented otherwise.
pub trait LedgerTx {
    // ── Accounts ───────────────────────────────────────────────

    fn account(&self, user_id: &str) -> WalletResult<Option<WalletAccount>>;

    /// Insert unless an account for the same user exists.
    /// Returns whether a row was written.
    fn insert_account(&mut self, account: &WalletAccount) -> WalletResult<bool>;

    /// Insert or overwrite the account keyed by its user id.
    fn save_account(&mut self, account: &WalletAccount) -> WalletResult<()>;

    // ── Recharge requests ──────────────────────────────────────

    fn recharge(&self, recharge_id: &str) -> WalletResult<Option<RechargeRequest>>;

    fn insert_recharge(&mut self, recharge: &RechargeRequest) -> WalletResult<()>;

    fn update_recharge(&mut self, recharge: &RechargeRequest) -> WalletResult<()>;

    /// Ordered by `requested_at` descending.
    fn recharges_with_status(&self, status: RechargeStatus) -> WalletResult<Vec<RechargeRequest>>;

    /// Ordered by `requested_at` descending.
    fn user_recharges(&self, user_id: &str) -> WalletResult<Vec<RechargeRequest>>;

    // ── Ledger transactions (append-only) ──────────────────────

    fn append_transaction(&mut self, tx: &LedgerTransaction) -> WalletResult<()>;

    fn user_transactions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> WalletResult<Vec<LedgerTransaction>>;

    fn all_transactions(&self, limit: Option<usize>) -> WalletResult<Vec<LedgerTransaction>>;

    fn user_transaction_count(&self, user_id: &str) -> WalletResult<u64>;

    // ── Payment distributions ──────────────────────────────────

    fn distribution(&self, distribution_id: &str) -> WalletResult<Option<PaymentDistribution>>;

    fn insert_distribution(&mut self, distribution: &PaymentDistribution) -> WalletResult<()>;

    fn update_distribution(&mut self, distribution: &PaymentDistribution) -> WalletResult<()>;

    /// Distributions in `status` with `scheduled_for <= until`,
    /// ordered by `scheduled_for` ascending.
    fn distributions_due(
        &self,
        status: DistributionStatus,
        until: Timestamp,
    ) -> WalletResult<Vec<PaymentDistribution>>;

    /// Ordered by `created_at` descending.
    fn kommuter_distributions(&self, kommuter_id: &str) -> WalletResult<Vec<PaymentDistribution>>;

    // ── Event log ──────────────────────────────────────────────

    fn append_event(&mut self, entry: &EventLogEntry) -> WalletResult<()>;

    fn recent_events(&self, limit: usize) -> WalletResult<Vec<EventLogEntry>>;
}
