//! Recharge workflow: top-up requests and their one-time review.
//!
//! A request is born `pending` and is reviewed exactly once. Approval is
//! a single atomic unit: status check, credit, account upsert, ledger
//! append and audit event commit together or not at all. Because the
//! status check runs inside the unit, re-running an approval after a
//! conflict, or a second reviewer approving the same request, fails with
//! `AlreadyReviewed` instead of crediting twice.

use crate::{
    account_manager::credit,
    clock::WalletClock,
    error::{WalletError, WalletResult},
    event::{record, WalletEvent},
    models::{
        LedgerTransaction, Metadata, ReceiptRef, RechargeRequest, RechargeStatus,
        TransactionKind, WalletAccount, TAG_RECHARGE_ID,
    },
    profile::{PayeeProfile, ProfileDirectory},
    store::{LedgerStore, LedgerTx},
    types::{new_entity_id, Amount},
};
use serde::Serialize;
use std::sync::Arc;

/// A pending request as shown in the review queue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecharge {
    #[serde(flatten)]
    pub recharge: RechargeRequest,
    pub payee: Option<PayeeProfile>,
}

/// Everything an approval wrote.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RechargeApproval {
    pub recharge: RechargeRequest,
    pub account: WalletAccount,
    pub transaction: LedgerTransaction,
}

pub struct RechargeWorkflow<S: LedgerStore> {
    store: Arc<S>,
    clock: Arc<dyn WalletClock>,
    profiles: Arc<dyn ProfileDirectory>,
}

impl<S: LedgerStore> RechargeWorkflow<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn WalletClock>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            store,
            clock,
            profiles,
        }
    }

    pub fn create_recharge(
        &self,
        user_id: &str,
        amount: Amount,
        receipt: ReceiptRef,
        sinpe_reference: Option<String>,
    ) -> WalletResult<RechargeRequest> {
        if amount <= 0 {
            log::warn!("recharge rejected for user {user_id}: invalid amount {amount}");
            return Err(WalletError::InvalidAmount { amount });
        }
        if !receipt.is_complete() {
            log::warn!("recharge rejected for user {user_id}: incomplete receipt reference");
            return Err(WalletError::InvalidReceipt);
        }

        let id = new_entity_id();
        let recharge = self.store.run_atomic(|tx| {
            let now = self.clock.now();
            let recharge = RechargeRequest {
                id: id.clone(),
                user_id: user_id.to_string(),
                amount,
                receipt: receipt.clone(),
                sinpe_reference: sinpe_reference.clone(),
                status: RechargeStatus::Pending,
                notes: None,
                rejection_reason: None,
                requested_at: now,
                reviewed_at: None,
                reviewed_by: None,
            };
            tx.insert_recharge(&recharge)?;
            record(
                tx,
                &WalletEvent::RechargeRequested {
                    recharge_id: recharge.id.clone(),
                    user_id: recharge.user_id.clone(),
                    amount,
                },
                now,
            )?;
            Ok(recharge)
        })?;

        log::info!("recharge {} requested by {user_id} for {amount}", recharge.id);
        Ok(recharge)
    }

    /// Pending requests, newest first, with the payee's display details.
    pub fn list_pending(&self) -> WalletResult<Vec<PendingRecharge>> {
        let pending = self
            .store
            .read_only(|tx| tx.recharges_with_status(RechargeStatus::Pending))?;
        Ok(pending
            .into_iter()
            .map(|recharge| PendingRecharge {
                payee: self.profiles.resolve(&recharge.user_id),
                recharge,
            })
            .collect())
    }

    pub fn approve(
        &self,
        recharge_id: &str,
        reviewer_id: &str,
        notes: Option<String>,
    ) -> WalletResult<RechargeApproval> {
        let approval = self
            .store
            .run_atomic(|tx| {
                let now = self.clock.now();
                let mut recharge = pending_recharge(tx, recharge_id)?;

                let mut account = match tx.account(&recharge.user_id)? {
                    Some(account) => account,
                    None => {
                        record(
                            tx,
                            &WalletEvent::AccountInitialized {
                                user_id: recharge.user_id.clone(),
                            },
                            now,
                        )?;
                        WalletAccount::empty(&recharge.user_id, now)
                    }
                };
                let (balance_before, balance_after) = credit(&mut account, recharge.amount)?;
                account.last_updated = now;

                recharge.status = RechargeStatus::Approved;
                recharge.reviewed_at = Some(now);
                recharge.reviewed_by = Some(reviewer_id.to_string());
                recharge.notes = notes.clone();

                let mut metadata = Metadata::new();
                metadata.insert(TAG_RECHARGE_ID.into(), recharge.id.clone().into());
                let transaction = LedgerTransaction {
                    id: new_entity_id(),
                    user_id: recharge.user_id.clone(),
                    kind: TransactionKind::Recharge,
                    amount: recharge.amount,
                    balance_before,
                    balance_after,
                    trip_id: None,
                    recharge_id: Some(recharge.id.clone()),
                    description: format!("Wallet recharge of {} CRC", recharge.amount),
                    created_at: now,
                    metadata,
                };

                tx.update_recharge(&recharge)?;
                tx.save_account(&account)?;
                tx.append_transaction(&transaction)?;
                record(
                    tx,
                    &WalletEvent::RechargeApproved {
                        recharge_id: recharge.id.clone(),
                        user_id: recharge.user_id.clone(),
                        reviewer_id: reviewer_id.to_string(),
                        amount: recharge.amount,
                        balance_after,
                    },
                    now,
                )?;

                Ok(RechargeApproval {
                    recharge,
                    account,
                    transaction,
                })
            })
            .inspect_err(|err| {
                log::warn!("approve of recharge {recharge_id} by {reviewer_id} failed: {err}")
            })?;

        log::info!(
            "recharge {recharge_id} approved by {reviewer_id}: user {} balance {} -> {}",
            approval.recharge.user_id,
            approval.transaction.balance_before,
            approval.transaction.balance_after,
        );
        Ok(approval)
    }

    /// Close a pending request without touching any balance.
    pub fn reject(
        &self,
        recharge_id: &str,
        reviewer_id: &str,
        reason: &str,
    ) -> WalletResult<RechargeRequest> {
        let recharge = self
            .store
            .run_atomic(|tx| {
                let now = self.clock.now();
                let mut recharge = pending_recharge(tx, recharge_id)?;
                recharge.status = RechargeStatus::Rejected;
                recharge.rejection_reason = Some(reason.to_string());
                recharge.reviewed_at = Some(now);
                recharge.reviewed_by = Some(reviewer_id.to_string());

                tx.update_recharge(&recharge)?;
                record(
                    tx,
                    &WalletEvent::RechargeRejected {
                        recharge_id: recharge.id.clone(),
                        user_id: recharge.user_id.clone(),
                        reviewer_id: reviewer_id.to_string(),
                        reason: reason.to_string(),
                    },
                    now,
                )?;
                Ok(recharge)
            })
            .inspect_err(|err| {
                log::warn!("reject of recharge {recharge_id} by {reviewer_id} failed: {err}")
            })?;

        log::info!("recharge {recharge_id} rejected by {reviewer_id}: {reason}");
        Ok(recharge)
    }

    pub fn get_recharge(&self, recharge_id: &str) -> WalletResult<RechargeRequest> {
        self.store.read_only(|tx| {
            tx.recharge(recharge_id)?
                .ok_or_else(|| WalletError::not_found("recharge", recharge_id))
        })
    }

    /// The user's recharge history, newest first.
    pub fn user_recharges(&self, user_id: &str) -> WalletResult<Vec<RechargeRequest>> {
        self.store.read_only(|tx| tx.user_recharges(user_id))
    }
}

/// Load a recharge that is still awaiting review.
fn pending_recharge(tx: &mut dyn LedgerTx, recharge_id: &str) -> WalletResult<RechargeRequest> {
    let recharge = tx
        .recharge(recharge_id)?
        .ok_or_else(|| WalletError::not_found("recharge", recharge_id))?;
    if recharge.status != RechargeStatus::Pending {
        return Err(WalletError::AlreadyReviewed {
            recharge_id: recharge.id,
            status: recharge.status.to_string(),
        });
    }
    Ok(recharge)
}
