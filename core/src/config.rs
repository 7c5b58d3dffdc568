use crate::types::CURRENCY;
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Trip metering ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TripPolicy {
    /// Trips per account exempt from pre-authorization.
    pub no_validation_limit: u32,
    /// Every `bonus_interval` paid trips grants one free trip.
    pub bonus_interval: u32,
}

impl Default for TripPolicy {
    fn default() -> Self {
        Self {
            no_validation_limit: 2,
            bonus_interval: 20,
        }
    }
}

// ── Distribution scheduling ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DistributionConfig {
    pub cutoff_hour: u32,
    pub cutoff_minute: u32,
    /// Offset of the settlement timezone from UTC. Costa Rica is UTC-6
    /// with no daylight saving.
    pub utc_offset_minutes: i32,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            cutoff_hour: 13,
            cutoff_minute: 0,
            utc_offset_minutes: -360,
        }
    }
}

impl DistributionConfig {
    pub fn cutoff(&self) -> anyhow::Result<NaiveTime> {
        NaiveTime::from_hms_opt(self.cutoff_hour, self.cutoff_minute, 0).ok_or_else(|| {
            anyhow::anyhow!(
                "cutoff {:02}:{:02} is not a time of day",
                self.cutoff_hour,
                self.cutoff_minute
            )
        })
    }

    pub fn offset(&self) -> anyhow::Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            anyhow::anyhow!("utc offset {} minutes is out of range", self.utc_offset_minutes)
        })
    }
}

// ── Ledger store ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts at an atomic unit before ConcurrentModification surfaces.
    pub max_attempts: u32,
    /// Base of the jittered backoff between attempts.
    pub backoff_base_ms: u64,
    /// SQLite busy handler wait before a lock attempt reports busy;
    /// 0 leaves all contention to the retry loop.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_base_ms: 5,
            busy_timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    /// Backoff before retry number `attempt` (1-based), capped at 32x base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;
        if self.backoff_base_ms == 0 {
            return Duration::ZERO;
        }
        let ceiling = self.backoff_base_ms << attempt.min(5);
        let jittered = rand::thread_rng().gen_range(self.backoff_base_ms..=ceiling);
        Duration::from_millis(jittered)
    }
}

// ── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalletConfig {
    pub currency: String,
    pub trips: TripPolicy,
    pub distribution: DistributionConfig,
    pub store: StoreConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            currency: CURRENCY.to_string(),
            trips: TripPolicy::default(),
            distribution: DistributionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl WalletConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    /// In tests, use WalletConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: WalletConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with no retry backoff so contention tests run fast.
    pub fn default_test() -> Self {
        Self {
            store: StoreConfig {
                max_attempts: 64,
                backoff_base_ms: 0,
                busy_timeout_ms: 1_000,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.currency != CURRENCY {
            anyhow::bail!("currency must be {CURRENCY}, got {}", self.currency);
        }
        if self.trips.bonus_interval == 0 {
            anyhow::bail!("trips.bonus_interval must be positive");
        }
        if self.store.max_attempts == 0 {
            anyhow::bail!("store.max_attempts must be at least 1");
        }
        if self.distribution.utc_offset_minutes.unsigned_abs() > 14 * 60 {
            anyhow::bail!(
                "distribution.utc_offset_minutes must be within +/-14h, got {}",
                self.distribution.utc_offset_minutes
            );
        }
        self.distribution.cutoff()?;
        self.distribution.offset()?;
        Ok(())
    }
}
