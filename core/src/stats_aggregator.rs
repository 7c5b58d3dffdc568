//! Stats aggregator: read-only wallet summary for display.

use crate::{
    config::TripPolicy,
    error::WalletResult,
    models::RechargeStatus,
    store::LedgerStore,
    types::{Amount, Timestamp},
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletStats {
    pub total_balance: Amount,
    pub pending_recharges: u64,
    pub total_transactions: u64,
    /// When the newest approved recharge was approved.
    pub last_recharge: Option<Timestamp>,
    pub no_validation_trips_remaining: u32,
    pub total_trips_completed: u32,
    pub bonus_trips_available: u32,
}

pub struct StatsAggregator<S: LedgerStore> {
    store: Arc<S>,
    policy: TripPolicy,
}

impl<S: LedgerStore> StatsAggregator<S> {
    pub fn new(store: Arc<S>, policy: TripPolicy) -> Self {
        Self { store, policy }
    }

    /// Reads one consistent snapshot. A user without an account gets
    /// zeroed stats; no account is created.
    pub fn get_stats(&self, user_id: &str) -> WalletResult<WalletStats> {
        self.store.read_only(|tx| {
            let account = tx.account(user_id)?;
            let recharges = tx.user_recharges(user_id)?;
            let total_transactions = tx.user_transaction_count(user_id)?;

            let pending_recharges = recharges
                .iter()
                .filter(|r| r.status == RechargeStatus::Pending)
                .count() as u64;
            let last_recharge = recharges
                .iter()
                .filter(|r| r.status == RechargeStatus::Approved)
                .filter_map(|r| r.reviewed_at)
                .max();

            let used = account.as_ref().map_or(0, |a| a.no_validation_trips_used);
            Ok(WalletStats {
                total_balance: account.as_ref().map_or(0, |a| a.balance),
                pending_recharges,
                total_transactions,
                last_recharge,
                no_validation_trips_remaining: self.policy.no_validation_limit.saturating_sub(used),
                total_trips_completed: account.as_ref().map_or(0, |a| a.total_trips_completed),
                bonus_trips_available: account.as_ref().map_or(0, |a| a.bonus_trips_available),
            })
        })
    }
}
