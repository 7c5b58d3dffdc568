//! The wallet engine: one façade over every component, wired to a
//! single store, clock, config and profile directory.
//!
//! CONTROL FLOW:
//!   API layer ─▶ WalletEngine ─▶ component ─▶ LedgerStore::run_atomic
//!
//! RULES:
//!   - Components never call each other; shared balance primitives live
//!     in account_manager.
//!   - Every mutation commits together with its ledger rows and audit
//!     events, or not at all.
//!   - The engine holds no mutable state of its own. Any number of
//!     request handlers may share one engine behind an `Arc`.

use crate::{
    account_manager::AccountManager,
    clock::{SystemClock, WalletClock},
    config::WalletConfig,
    distribution_scheduler::DistributionScheduler,
    error::WalletResult,
    event::{EventLogEntry, WalletEvent},
    models::{LedgerTransaction, PaymentDistribution, ReceiptRef, RechargeRequest, WalletAccount},
    profile::{ProfileDirectory, StaticProfileDirectory},
    recharge_workflow::{PendingRecharge, RechargeApproval, RechargeWorkflow},
    stats_aggregator::{StatsAggregator, WalletStats},
    store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore},
    trip_fund_meter::{TripFundMeter, TripHold},
    types::{Amount, Timestamp},
};
use std::sync::Arc;

pub struct WalletEngine<S: LedgerStore> {
    pub accounts:      AccountManager<S>,
    pub recharges:     RechargeWorkflow<S>,
    pub trips:         TripFundMeter<S>,
    pub distributions: DistributionScheduler<S>,
    pub stats:         StatsAggregator<S>,
    store:             Arc<S>,
    config:            WalletConfig,
}

impl<S: LedgerStore> WalletEngine<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn WalletClock>,
        profiles: Arc<dyn ProfileDirectory>,
        config: WalletConfig,
    ) -> WalletResult<Self> {
        config.validate()?;
        Ok(Self {
            accounts: AccountManager::new(Arc::clone(&store), Arc::clone(&clock)),
            recharges: RechargeWorkflow::new(Arc::clone(&store), Arc::clone(&clock), profiles),
            trips: TripFundMeter::new(Arc::clone(&store), Arc::clone(&clock), config.trips.clone()),
            distributions: DistributionScheduler::new(
                Arc::clone(&store),
                clock,
                &config.distribution,
            )?,
            stats: StatsAggregator::new(Arc::clone(&store), config.trips.clone()),
            store,
            config,
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ── Accounts ───────────────────────────────────────────────

    pub fn get_balance(&self, user_id: &str) -> WalletResult<Option<WalletAccount>> {
        self.accounts.get_balance(user_id)
    }

    pub fn initialize_balance(&self, user_id: &str) -> WalletResult<WalletAccount> {
        self.accounts.initialize_balance(user_id)
    }

    // ── Recharges ──────────────────────────────────────────────

    pub fn create_recharge(
        &self,
        user_id: &str,
        amount: Amount,
        receipt: ReceiptRef,
        sinpe_reference: Option<String>,
    ) -> WalletResult<RechargeRequest> {
        self.recharges
            .create_recharge(user_id, amount, receipt, sinpe_reference)
    }

    pub fn list_pending(&self) -> WalletResult<Vec<PendingRecharge>> {
        self.recharges.list_pending()
    }

    pub fn approve(
        &self,
        recharge_id: &str,
        reviewer_id: &str,
        notes: Option<String>,
    ) -> WalletResult<RechargeApproval> {
        self.recharges.approve(recharge_id, reviewer_id, notes)
    }

    pub fn reject(
        &self,
        recharge_id: &str,
        reviewer_id: &str,
        reason: &str,
    ) -> WalletResult<RechargeRequest> {
        self.recharges.reject(recharge_id, reviewer_id, reason)
    }

    // ── Ledger ─────────────────────────────────────────────────

    /// The user's ledger, newest first.
    pub fn get_user_transactions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> WalletResult<Vec<LedgerTransaction>> {
        self.store
            .read_only(|tx| tx.user_transactions(user_id, Some(limit)))
    }

    /// Every user's ledger, newest first. Admin only.
    pub fn get_all_transactions(&self, limit: usize) -> WalletResult<Vec<LedgerTransaction>> {
        self.store.read_only(|tx| tx.all_transactions(Some(limit)))
    }

    /// The audit log, newest first, decoded.
    pub fn recent_events(&self, limit: usize) -> WalletResult<Vec<WalletEvent>> {
        let entries: Vec<EventLogEntry> = self.store.read_only(|tx| tx.recent_events(limit))?;
        entries.iter().map(EventLogEntry::decode).collect()
    }

    pub fn get_stats(&self, user_id: &str) -> WalletResult<WalletStats> {
        self.stats.get_stats(user_id)
    }

    // ── Trips ──────────────────────────────────────────────────

    pub fn hold_funds_for_trip(
        &self,
        user_id: &str,
        trip_id: &str,
        amount: Amount,
    ) -> WalletResult<TripHold> {
        self.trips.hold_funds_for_trip(user_id, trip_id, amount)
    }

    // ── Distributions ──────────────────────────────────────────

    pub fn schedule(
        &self,
        kommuter_id: &str,
        trip_id: &str,
        amount: Amount,
    ) -> WalletResult<PaymentDistribution> {
        self.distributions.schedule(kommuter_id, trip_id, amount)
    }

    pub fn list_due(&self, now: Timestamp) -> WalletResult<Vec<PaymentDistribution>> {
        self.distributions.list_due(now)
    }

    pub fn mark_processing(&self, distribution_id: &str) -> WalletResult<PaymentDistribution> {
        self.distributions.mark_processing(distribution_id)
    }

    pub fn mark_completed(
        &self,
        distribution_id: &str,
        settlement_reference: &str,
    ) -> WalletResult<PaymentDistribution> {
        self.distributions
            .mark_completed(distribution_id, settlement_reference)
    }

    pub fn mark_failed(
        &self,
        distribution_id: &str,
        reason: &str,
    ) -> WalletResult<PaymentDistribution> {
        self.distributions.mark_failed(distribution_id, reason)
    }
}

impl WalletEngine<SqliteLedgerStore> {
    /// Open (or create) a SQLite-backed engine at `path` on the system clock.
    pub fn open_sqlite(
        path: &str,
        profiles: Arc<dyn ProfileDirectory>,
        config: WalletConfig,
    ) -> WalletResult<Self> {
        let store = SqliteLedgerStore::open(path, config.store.clone())?;
        store.migrate()?;
        Self::new(Arc::new(store), Arc::new(SystemClock), profiles, config)
    }
}

impl WalletEngine<MemoryLedgerStore> {
    /// In-memory engine with test config and no payee profiles.
    pub fn build_test(clock: Arc<dyn WalletClock>) -> WalletResult<Self> {
        let config = WalletConfig::default_test();
        let store = Arc::new(MemoryLedgerStore::new(config.store.clone()));
        Self::new(store, clock, Arc::new(StaticProfileDirectory::new()), config)
    }
}
