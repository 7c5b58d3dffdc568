//! Trip fund meter: charges each completed trip against the rider's
//! wallet under a three-tier policy.
//!
//! TIER ORDER (first match wins):
//!   1. Bonus        an accrued free trip; nothing is charged.
//!   2. NoValidation one of the account's first trips exempt from
//!                   pre-authorization; charged in full.
//!   3. Standard     charged in full.
//!
//! Every `bonus_interval`-th trip paid under tiers 2 or 3 earns a bonus
//! trip. A bonus trip that lands on the interval earns nothing.
//!
//! The tier is chosen by `select_tier`, a pure function of the account
//! snapshot. `hold_funds_for_trip` re-runs the choice inside the atomic
//! unit on every attempt, so a retry after a conflict sees fresh counters
//! and a fresh timestamp. Ledger rows therefore carry `created_at` in
//! commit order.

use crate::{
    account_manager::debit,
    clock::WalletClock,
    config::TripPolicy,
    error::{WalletError, WalletResult},
    event::{record, WalletEvent},
    models::{
        LedgerTransaction, Metadata, TransactionKind, WalletAccount, TAG_BONUS_EARNED,
        TAG_BONUS_TRIP, TAG_NO_VALIDATION_TRIP,
    },
    store::{LedgerStore, LedgerTx},
    types::{new_entity_id, Amount, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Bonus,
    NoValidation,
    Standard,
}

/// Which tier the next trip on `account` falls under.
pub fn select_tier(account: &WalletAccount, policy: &TripPolicy) -> Tier {
    if account.bonus_trips_available > 0 {
        Tier::Bonus
    } else if account.no_validation_trips_used < policy.no_validation_limit {
        Tier::NoValidation
    } else {
        Tier::Standard
    }
}

/// Outcome of one metered trip.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TripHold {
    pub tier: Tier,
    pub charged: Amount,
    pub bonus_earned: bool,
    pub account: WalletAccount,
    pub transaction: LedgerTransaction,
}

pub struct TripFundMeter<S: LedgerStore> {
    store: Arc<S>,
    clock: Arc<dyn WalletClock>,
    policy: TripPolicy,
}

impl<S: LedgerStore> TripFundMeter<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn WalletClock>, policy: TripPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &TripPolicy {
        &self.policy
    }

    /// Meter one completed trip. Called once per trip.
    pub fn hold_funds_for_trip(
        &self,
        user_id: &str,
        trip_id: &str,
        amount: Amount,
    ) -> WalletResult<TripHold> {
        if amount < 0 {
            log::warn!("trip {trip_id} for user {user_id}: invalid amount {amount}");
            return Err(WalletError::InvalidAmount { amount });
        }

        let hold = self
            .store
            .run_atomic(|tx| self.apply(tx, user_id, trip_id, amount, self.clock.now()))
            .inspect_err(|err| log::warn!("trip {trip_id} for user {user_id} not metered: {err}"))?;

        log::info!(
            "trip {trip_id} metered for user {user_id}: tier={:?} charged={} balance={}",
            hold.tier,
            hold.charged,
            hold.account.balance,
        );
        if hold.bonus_earned {
            log::info!(
                "user {user_id} earned a bonus trip at {} completed trips",
                hold.account.total_trips_completed
            );
        }
        Ok(hold)
    }

    fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: &str,
        trip_id: &str,
        amount: Amount,
        now: Timestamp,
    ) -> WalletResult<TripHold> {
        let mut account = tx
            .account(user_id)?
            .ok_or_else(|| WalletError::not_found("account", user_id))?;
        let tier = select_tier(&account, &self.policy);
        let balance_before = account.balance;
        let mut metadata = Metadata::new();

        let (charged, description) = match tier {
            Tier::Bonus => {
                account.bonus_trips_available -= 1;
                metadata.insert(TAG_BONUS_TRIP.into(), true.into());
                (
                    0,
                    format!(
                        "Bonus trip, no charge ({} bonus trips left)",
                        account.bonus_trips_available
                    ),
                )
            }
            Tier::NoValidation => {
                debit(&mut account, amount)?;
                account.no_validation_trips_used += 1;
                metadata.insert(TAG_NO_VALIDATION_TRIP.into(), true.into());
                let limit = self.policy.no_validation_limit;
                let remaining = limit.saturating_sub(account.no_validation_trips_used);
                (
                    amount,
                    format!("No-validation trip ({remaining} of {limit} remaining)"),
                )
            }
            Tier::Standard => {
                debit(&mut account, amount)?;
                (amount, "Trip fare".to_string())
            }
        };

        account.total_trips_completed += 1;
        let bonus_earned = tier != Tier::Bonus
            && self.policy.bonus_interval > 0
            && account.total_trips_completed % self.policy.bonus_interval == 0;
        if bonus_earned {
            account.bonus_trips_available += 1;
            metadata.insert(TAG_BONUS_EARNED.into(), true.into());
        }
        account.last_updated = now;

        let transaction = LedgerTransaction {
            id: new_entity_id(),
            user_id: user_id.to_string(),
            kind: TransactionKind::TripHold,
            amount: charged,
            balance_before,
            balance_after: account.balance,
            trip_id: Some(trip_id.to_string()),
            recharge_id: None,
            description,
            created_at: now,
            metadata,
        };

        tx.save_account(&account)?;
        tx.append_transaction(&transaction)?;
        record(
            tx,
            &WalletEvent::TripFundsHeld {
                user_id: user_id.to_string(),
                trip_id: trip_id.to_string(),
                tier,
                charged,
                balance_after: account.balance,
            },
            now,
        )?;
        if bonus_earned {
            record(
                tx,
                &WalletEvent::BonusTripEarned {
                    user_id: user_id.to_string(),
                    trip_id: trip_id.to_string(),
                    total_trips_completed: account.total_trips_completed,
                },
                now,
            )?;
        }

        Ok(TripHold {
            tier,
            charged,
            bonus_earned,
            account,
            transaction,
        })
    }
}
