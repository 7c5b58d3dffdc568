//! Account manager: wallet account lifecycle and the balance primitives
//! the recharge and trip components build on.
//!
//! Balances are never mutated through a public call. The `credit` and
//! `debit` primitives below only touch an in-flight copy of the account;
//! callers persist it in the same atomic unit as the ledger row that
//! explains the change.

use crate::{
    clock::WalletClock,
    error::{WalletError, WalletResult},
    event::{record, WalletEvent},
    models::WalletAccount,
    store::LedgerStore,
    types::Amount,
};
use std::sync::Arc;

pub struct AccountManager<S: LedgerStore> {
    store: Arc<S>,
    clock: Arc<dyn WalletClock>,
}

impl<S: LedgerStore> AccountManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn WalletClock>) -> Self {
        Self { store, clock }
    }

    /// Pure lookup; never creates an account.
    pub fn get_balance(&self, user_id: &str) -> WalletResult<Option<WalletAccount>> {
        self.store.read_only(|tx| tx.account(user_id))
    }

    /// Return the user's account, creating a zeroed one if none exists.
    /// Safe to call repeatedly and concurrently: at most one row is ever
    /// written per user.
    pub fn initialize_balance(&self, user_id: &str) -> WalletResult<WalletAccount> {
        let (account, created) = self.store.run_atomic(|tx| {
            let now = self.clock.now();
            if let Some(existing) = tx.account(user_id)? {
                return Ok((existing, false));
            }
            let account = WalletAccount::empty(user_id, now);
            if !tx.insert_account(&account)? {
                let existing = tx
                    .account(user_id)?
                    .ok_or_else(|| WalletError::not_found("account", user_id))?;
                return Ok((existing, false));
            }
            record(
                tx,
                &WalletEvent::AccountInitialized {
                    user_id: user_id.to_string(),
                },
                now,
            )?;
            Ok((account, true))
        })?;

        if created {
            log::info!("wallet account initialized for user {user_id}");
        }
        Ok(account)
    }
}

/// Add `amount` to the account. Returns `(balance_before, balance_after)`.
pub(crate) fn credit(account: &mut WalletAccount, amount: Amount) -> WalletResult<(Amount, Amount)> {
    if amount < 0 {
        return Err(WalletError::InvalidAmount { amount });
    }
    let before = account.balance;
    account.balance = before
        .checked_add(amount)
        .ok_or(WalletError::InvalidAmount { amount })?;
    Ok((before, account.balance))
}

/// Take `amount` from the account. The balance never goes negative.
/// Returns `(balance_before, balance_after)`.
pub(crate) fn debit(account: &mut WalletAccount, amount: Amount) -> WalletResult<(Amount, Amount)> {
    if amount < 0 {
        return Err(WalletError::InvalidAmount { amount });
    }
    let before = account.balance;
    if before < amount {
        return Err(WalletError::InsufficientBalance {
            user_id: account.user_id.clone(),
            balance: before,
            required: amount,
        });
    }
    account.balance = before - amount;
    Ok((before, account.balance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn account(balance: Amount) -> WalletAccount {
        let mut a = WalletAccount::empty("u-1", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        a.balance = balance;
        a
    }

    #[test]
    fn debit_refuses_to_overdraw() {
        let mut a = account(250);
        match debit(&mut a, 300) {
            Err(WalletError::InsufficientBalance { balance, required, .. }) => {
                assert_eq!((balance, required), (250, 300));
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }
        assert_eq!(a.balance, 250);
        assert_eq!(debit(&mut a, 250).unwrap(), (250, 0));
    }

    #[test]
    fn credit_rejects_overflow_without_touching_balance() {
        let mut a = account(i64::MAX - 1);
        assert!(matches!(credit(&mut a, 5), Err(WalletError::InvalidAmount { .. })));
        assert_eq!(a.balance, i64::MAX - 1);
        assert_eq!(credit(&mut account(10), 5).unwrap(), (10, 15));
    }
}
