use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Recharge '{recharge_id}' was already reviewed (status: {status})")]
    AlreadyReviewed { recharge_id: String, status: String },

    #[error("Invalid amount: {amount}")]
    InvalidAmount { amount: i64 },

    #[error("Insufficient balance for user '{user_id}': balance {balance}, required {required}")]
    InsufficientBalance {
        user_id: String,
        balance: i64,
        required: i64,
    },

    #[error("Concurrent modification: gave up after {attempts} attempts")]
    ConcurrentModification { attempts: u32 },

    #[error("Distribution '{distribution_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        distribution_id: String,
        from: String,
        to: String,
    },

    #[error("Recharge receipt must carry both a URL and a file name")]
    InvalidReceipt,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WalletError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True only for conflicts a caller may retry. Stores retry these
    /// internally; one reaching a caller means the retry budget ran out.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

pub type WalletResult<T> = Result<T, WalletError>;
