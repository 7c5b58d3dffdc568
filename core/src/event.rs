//! The audit event log.
//!
//! RULE: every state change is recorded in the event log, inside the
//! same atomic unit as the change itself. A rolled-back unit leaves no
//! event behind.

use crate::{
    trip_fund_meter::Tier,
    types::{Amount, EntityId, Timestamp, UserId},
};
use serde::{Deserialize, Serialize};

/// Every event the engine records.
/// Variants are only ever appended, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    // ── Accounts ───────────────────────────────────
    AccountInitialized {
        user_id: UserId,
    },

    // ── Recharges ──────────────────────────────────
    RechargeRequested {
        recharge_id: EntityId,
        user_id: UserId,
        amount: Amount,
    },
    RechargeApproved {
        recharge_id: EntityId,
        user_id: UserId,
        reviewer_id: UserId,
        amount: Amount,
        balance_after: Amount,
    },
    RechargeRejected {
        recharge_id: EntityId,
        user_id: UserId,
        reviewer_id: UserId,
        reason: String,
    },

    // ── Trips ──────────────────────────────────────
    TripFundsHeld {
        user_id: UserId,
        trip_id: EntityId,
        tier: Tier,
        charged: Amount,
        balance_after: Amount,
    },
    BonusTripEarned {
        user_id: UserId,
        trip_id: EntityId,
        total_trips_completed: u32,
    },

    // ── Distributions ──────────────────────────────
    DistributionScheduled {
        distribution_id: EntityId,
        kommuter_id: UserId,
        trip_id: EntityId,
        amount: Amount,
        scheduled_for: Timestamp,
    },
    DistributionProcessing {
        distribution_id: EntityId,
    },
    DistributionCompleted {
        distribution_id: EntityId,
        sinpe_reference: String,
    },
    DistributionFailed {
        distribution_id: EntityId,
        reason: String,
    },
}

impl WalletEvent {
    /// Stable name stored in the event_type column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AccountInitialized { .. }     => "account_initialized",
            Self::RechargeRequested { .. }      => "recharge_requested",
            Self::RechargeApproved { .. }       => "recharge_approved",
            Self::RechargeRejected { .. }       => "recharge_rejected",
            Self::TripFundsHeld { .. }          => "trip_funds_held",
            Self::BonusTripEarned { .. }        => "bonus_trip_earned",
            Self::DistributionScheduled { .. }  => "distribution_scheduled",
            Self::DistributionProcessing { .. } => "distribution_processing",
            Self::DistributionCompleted { .. }  => "distribution_completed",
            Self::DistributionFailed { .. }     => "distribution_failed",
        }
    }
}

/// A row in the event_log table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLogEntry {
    pub id:          Option<i64>,
    pub event_type:  String,
    pub payload:     String,
    pub recorded_at: Timestamp,
}

impl EventLogEntry {
    pub fn new(event: &WalletEvent, recorded_at: Timestamp) -> crate::error::WalletResult<Self> {
        Ok(Self {
            id: None,
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(event)?,
            recorded_at,
        })
    }

    pub fn decode(&self) -> crate::error::WalletResult<WalletEvent> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Append `event` to the log inside the caller's atomic unit.
pub fn record(
    tx: &mut dyn crate::store::LedgerTx,
    event: &WalletEvent,
    at: Timestamp,
) -> crate::error::WalletResult<()> {
    tx.append_event(&EventLogEntry::new(event, at)?)
}
