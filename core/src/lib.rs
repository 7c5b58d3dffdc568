//! Wallet ledger & settlement engine.
//!
//! Owns rider wallet balances, recharge review, per-trip fund metering
//! and kommuter payout scheduling. Storage sits behind
//! [`store::LedgerStore`]; everything else is storage-agnostic.

pub mod account_manager;
pub mod clock;
pub mod config;
pub mod distribution_scheduler;
pub mod engine;
pub mod error;
pub mod event;
pub mod models;
pub mod profile;
pub mod recharge_workflow;
pub mod stats_aggregator;
pub mod store;
pub mod trip_fund_meter;
pub mod types;

pub use engine::WalletEngine;
pub use error::{WalletError, WalletResult};
