//! Distribution scheduler: records payout intent for kommuters and the
//! terminal outcome reported by the external batch worker.
//!
//! LIFECYCLE:
//!   pending ──▶ processing ──▶ completed
//!      │             │
//!      └─────────────┴──────▶ failed
//!
//! Completed and failed are terminal. Retrying a failed payout is a new
//! `schedule()` call made by the worker, never a state change here.

use crate::{
    clock::WalletClock,
    config::DistributionConfig,
    error::{WalletError, WalletResult},
    event::{record, WalletEvent},
    models::{DistributionStatus, PaymentDistribution},
    store::LedgerStore,
    types::{new_entity_id, Amount, Timestamp},
};
use chrono::{Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use std::sync::Arc;

/// The settlement slot for a payout requested at `now`: today's cutoff
/// if `now` is at or before it in local time, otherwise tomorrow's.
pub fn next_settlement(now: Timestamp, cutoff: NaiveTime, offset: FixedOffset) -> Timestamp {
    let local = now.with_timezone(&offset);
    let today = local.date_naive();
    let day = if local.time() <= cutoff {
        today
    } else {
        today + Duration::days(1)
    };
    let local_slot = day.and_time(cutoff);
    let utc_slot = local_slot - Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc_slot)
}

pub struct DistributionScheduler<S: LedgerStore> {
    store: Arc<S>,
    clock: Arc<dyn WalletClock>,
    cutoff: NaiveTime,
    offset: FixedOffset,
}

impl<S: LedgerStore> DistributionScheduler<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn WalletClock>,
        config: &DistributionConfig,
    ) -> WalletResult<Self> {
        Ok(Self {
            store,
            clock,
            cutoff: config.cutoff()?,
            offset: config.offset()?,
        })
    }

    pub fn schedule(
        &self,
        kommuter_id: &str,
        trip_id: &str,
        amount: Amount,
    ) -> WalletResult<PaymentDistribution> {
        if amount <= 0 {
            log::warn!("distribution for kommuter {kommuter_id} trip {trip_id}: invalid amount {amount}");
            return Err(WalletError::InvalidAmount { amount });
        }

        let id = new_entity_id();
        let distribution = self.store.run_atomic(|tx| {
            let now = self.clock.now();
            let distribution = PaymentDistribution {
                id: id.clone(),
                kommuter_id: kommuter_id.to_string(),
                trip_id: trip_id.to_string(),
                amount,
                status: DistributionStatus::Pending,
                scheduled_for: next_settlement(now, self.cutoff, self.offset),
                processed_at: None,
                sinpe_reference: None,
                failure_reason: None,
                created_at: now,
            };
            tx.insert_distribution(&distribution)?;
            record(
                tx,
                &WalletEvent::DistributionScheduled {
                    distribution_id: distribution.id.clone(),
                    kommuter_id: distribution.kommuter_id.clone(),
                    trip_id: distribution.trip_id.clone(),
                    amount,
                    scheduled_for: distribution.scheduled_for,
                },
                now,
            )?;
            Ok(distribution)
        })?;

        log::info!(
            "distribution {} of {amount} to kommuter {kommuter_id} scheduled for {}",
            distribution.id,
            distribution.scheduled_for,
        );
        Ok(distribution)
    }

    /// Pending distributions whose slot has arrived, oldest slot first.
    /// The batch worker's polling read; has no side effects.
    pub fn list_due(&self, now: Timestamp) -> WalletResult<Vec<PaymentDistribution>> {
        self.store
            .read_only(|tx| tx.distributions_due(DistributionStatus::Pending, now))
    }

    /// Claim a pending distribution for payout.
    pub fn mark_processing(&self, distribution_id: &str) -> WalletResult<PaymentDistribution> {
        self.transition(
            distribution_id,
            DistributionStatus::Processing,
            &[DistributionStatus::Pending],
            |_, _| {},
            |d| WalletEvent::DistributionProcessing {
                distribution_id: d.id.clone(),
            },
        )
    }

    pub fn mark_completed(
        &self,
        distribution_id: &str,
        settlement_reference: &str,
    ) -> WalletResult<PaymentDistribution> {
        self.transition(
            distribution_id,
            DistributionStatus::Completed,
            &[DistributionStatus::Pending, DistributionStatus::Processing],
            |d, now| {
                d.processed_at = Some(now);
                d.sinpe_reference = Some(settlement_reference.to_string());
            },
            |d| WalletEvent::DistributionCompleted {
                distribution_id: d.id.clone(),
                sinpe_reference: settlement_reference.to_string(),
            },
        )
    }

    pub fn mark_failed(&self, distribution_id: &str, reason: &str) -> WalletResult<PaymentDistribution> {
        self.transition(
            distribution_id,
            DistributionStatus::Failed,
            &[DistributionStatus::Pending, DistributionStatus::Processing],
            |d, now| {
                d.processed_at = Some(now);
                d.failure_reason = Some(reason.to_string());
            },
            |d| WalletEvent::DistributionFailed {
                distribution_id: d.id.clone(),
                reason: reason.to_string(),
            },
        )
    }

    pub fn get_distribution(&self, distribution_id: &str) -> WalletResult<PaymentDistribution> {
        self.store.read_only(|tx| {
            tx.distribution(distribution_id)?
                .ok_or_else(|| WalletError::not_found("distribution", distribution_id))
        })
    }

    /// A kommuter's payouts, newest first.
    pub fn kommuter_distributions(&self, kommuter_id: &str) -> WalletResult<Vec<PaymentDistribution>> {
        self.store.read_only(|tx| tx.kommuter_distributions(kommuter_id))
    }

    fn transition(
        &self,
        distribution_id: &str,
        to: DistributionStatus,
        allowed_from: &[DistributionStatus],
        stamp: impl Fn(&mut PaymentDistribution, Timestamp),
        event: impl Fn(&PaymentDistribution) -> WalletEvent,
    ) -> WalletResult<PaymentDistribution> {
        let distribution = self
            .store
            .run_atomic(|tx| {
                let now = self.clock.now();
                let mut distribution = tx
                    .distribution(distribution_id)?
                    .ok_or_else(|| WalletError::not_found("distribution", distribution_id))?;
                if !allowed_from.contains(&distribution.status) {
                    return Err(WalletError::InvalidTransition {
                        distribution_id: distribution.id,
                        from: distribution.status.to_string(),
                        to: to.to_string(),
                    });
                }
                distribution.status = to;
                stamp(&mut distribution, now);
                tx.update_distribution(&distribution)?;
                record(tx, &event(&distribution), now)?;
                Ok(distribution)
            })
            .inspect_err(|err| {
                log::warn!("distribution {distribution_id} not moved to {to}: {err}")
            })?;

        log::info!(
            "distribution {distribution_id} for kommuter {} is now {to}",
            distribution.kommuter_id
        );
        Ok(distribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn costa_rica() -> FixedOffset {
        FixedOffset::west_opt(6 * 3600).unwrap()
    }

    fn local(h: u32, m: u32, s: u32) -> Timestamp {
        costa_rica()
            .with_ymd_and_hms(2024, 7, 10, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn cutoff() -> NaiveTime {
        NaiveTime::from_hms_opt(13, 0, 0).unwrap()
    }

    #[test]
    fn before_cutoff_settles_today() {
        let slot = next_settlement(local(12, 59, 0), cutoff(), costa_rica());
        assert_eq!(slot, local(13, 0, 0));
    }

    #[test]
    fn exactly_at_cutoff_settles_today() {
        let slot = next_settlement(local(13, 0, 0), cutoff(), costa_rica());
        assert_eq!(slot, local(13, 0, 0));
    }

    #[test]
    fn after_cutoff_settles_tomorrow() {
        let slot = next_settlement(local(13, 1, 0), cutoff(), costa_rica());
        assert_eq!(slot, local(13, 0, 0) + Duration::days(1));

        let slot = next_settlement(local(13, 0, 0) + Duration::milliseconds(1), cutoff(), costa_rica());
        assert_eq!(slot, local(13, 0, 0) + Duration::days(1));
    }

    #[test]
    fn local_day_is_used_not_utc_day() {
        // 23:30 local on the 10th is already the 11th in UTC.
        let now = local(23, 30, 0);
        assert_eq!(now.with_timezone(&Utc).hour(), 5);
        let slot = next_settlement(now, cutoff(), costa_rica());
        assert_eq!(slot, local(13, 0, 0) + Duration::days(1));
        assert_eq!(slot.with_timezone(&Utc).hour(), 19);
    }
}
