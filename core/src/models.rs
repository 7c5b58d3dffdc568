//! The four ledger entities and their status vocabularies.
//!
//! Status enums round-trip through the store as their snake_case names.

use crate::types::{Amount, EntityId, Timestamp, UserId, CURRENCY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form tags attached to a ledger transaction (`bonusTrip`, ...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

pub const TAG_BONUS_TRIP: &str = "bonusTrip";
pub const TAG_NO_VALIDATION_TRIP: &str = "noValidationTrip";
pub const TAG_BONUS_EARNED: &str = "bonusEarned";
pub const TAG_RECHARGE_ID: &str = "rechargeId";

// ── WalletAccount ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    pub user_id: UserId,
    pub balance: Amount,
    pub currency: String,
    pub no_validation_trips_used: u32,
    pub total_trips_completed: u32,
    pub bonus_trips_available: u32,
    pub created_at: Timestamp,
    pub last_updated: Timestamp,
}

impl WalletAccount {
    /// A zero-balance account with every counter at zero.
    pub fn empty(user_id: &str, now: Timestamp) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: 0,
            currency: CURRENCY.to_string(),
            no_validation_trips_used: 0,
            total_trips_completed: 0,
            bonus_trips_available: 0,
            created_at: now,
            last_updated: now,
        }
    }
}

// ── RechargeRequest ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RechargeStatus {
    Pending,
    Approved,
    Rejected,
}

impl RechargeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for RechargeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown recharge status '{other}'")),
        }
    }
}

impl fmt::Display for RechargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the proof-of-payment image lives in blob storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRef {
    pub url: String,
    pub file_name: String,
}

impl ReceiptRef {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.url.trim().is_empty() && !self.file_name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RechargeRequest {
    pub id: EntityId,
    pub user_id: UserId,
    pub amount: Amount,
    pub receipt: ReceiptRef,
    pub sinpe_reference: Option<String>,
    pub status: RechargeStatus,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub requested_at: Timestamp,
    pub reviewed_at: Option<Timestamp>,
    pub reviewed_by: Option<UserId>,
}

// ── LedgerTransaction ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Recharge,
    TripHold,
    TripPayment,
    TripRelease,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recharge => "recharge",
            Self::TripHold => "trip_hold",
            Self::TripPayment => "trip_payment",
            Self::TripRelease => "trip_release",
            Self::Refund => "refund",
        }
    }

    /// Whether this kind adds to the balance. Amounts are stored as
    /// magnitudes; the kind carries the sign.
    pub fn is_credit(self) -> bool {
        matches!(self, Self::Recharge | Self::TripRelease | Self::Refund)
    }

    /// The signed balance delta for a stored magnitude.
    pub fn signed(self, amount: Amount) -> Amount {
        if self.is_credit() {
            amount
        } else {
            -amount
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recharge" => Ok(Self::Recharge),
            "trip_hold" => Ok(Self::TripHold),
            "trip_payment" => Ok(Self::TripPayment),
            "trip_release" => Ok(Self::TripRelease),
            "refund" => Ok(Self::Refund),
            other => Err(format!("unknown transaction kind '{other}'")),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: EntityId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub amount: Amount,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub trip_id: Option<EntityId>,
    pub recharge_id: Option<EntityId>,
    pub description: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub metadata: Metadata,
}

impl LedgerTransaction {
    /// True when `key` is tagged with boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// `balance_after` agrees with `balance_before` and the signed amount.
    pub fn is_consistent(&self) -> bool {
        self.amount >= 0 && self.balance_before + self.kind.signed(self.amount) == self.balance_after
    }
}

// ── PaymentDistribution ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DistributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for DistributionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown distribution status '{other}'")),
        }
    }
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDistribution {
    pub id: EntityId,
    pub kommuter_id: UserId,
    pub trip_id: EntityId,
    pub amount: Amount,
    pub status: DistributionStatus,
    pub scheduled_for: Timestamp,
    pub processed_at: Option<Timestamp>,
    pub sinpe_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_kinds_carry_positive_sign() {
        assert_eq!(TransactionKind::Recharge.signed(500), 500);
        assert_eq!(TransactionKind::Refund.signed(500), 500);
        assert_eq!(TransactionKind::TripRelease.signed(500), 500);
        assert_eq!(TransactionKind::TripHold.signed(500), -500);
        assert_eq!(TransactionKind::TripPayment.signed(500), -500);
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            DistributionStatus::Pending,
            DistributionStatus::Processing,
            DistributionStatus::Completed,
            DistributionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DistributionStatus>(), Ok(status));
        }
        assert!("settled".parse::<RechargeStatus>().is_err());
        assert_eq!("trip_hold".parse::<TransactionKind>(), Ok(TransactionKind::TripHold));
    }

    #[test]
    fn serialized_transaction_uses_camel_case_and_type_field() {
        let tx = LedgerTransaction {
            id: "tx-1".into(),
            user_id: "u-1".into(),
            kind: TransactionKind::TripHold,
            amount: 300,
            balance_before: 1000,
            balance_after: 700,
            trip_id: Some("trip-1".into()),
            recharge_id: None,
            description: "Trip".into(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            metadata: Metadata::new(),
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "trip_hold");
        assert_eq!(json["balanceAfter"], 700);
        assert!(tx.is_consistent());
    }
}
