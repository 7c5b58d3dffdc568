//! SQLite store tests.
//!
//! Covers: schema migration, a full wallet flow persisted through one
//! connection and read back through a fresh one, ledger ordering and
//! metadata fidelity, the audit log surviving a restart, and reads that
//! never wait on another connection's open write.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use wallet_core::{
    clock::{ManualClock, WalletClock},
    config::{StoreConfig, WalletConfig},
    event::WalletEvent,
    models::{
        DistributionStatus, ReceiptRef, RechargeStatus, TransactionKind, WalletAccount,
        TAG_NO_VALIDATION_TRIP, TAG_RECHARGE_ID,
    },
    profile::StaticProfileDirectory,
    store::{LedgerStore, SqliteLedgerStore},
    trip_fund_meter::Tier,
    WalletEngine, WalletError,
};

struct TempDb(String);

impl TempDb {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("wallet-{}.db", uuid::Uuid::new_v4()));
        Self(path.to_string_lossy().into_owned())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.0));
        }
    }
}

fn engine_on(
    store: SqliteLedgerStore,
    clock: Arc<ManualClock>,
) -> WalletEngine<SqliteLedgerStore> {
    WalletEngine::new(
        Arc::new(store),
        clock,
        Arc::new(StaticProfileDirectory::new()),
        WalletConfig::default_test(),
    )
    .unwrap()
}

fn build_in_memory() -> (WalletEngine<SqliteLedgerStore>, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 8, 20, 17, 30, 0).unwrap(),
    ));
    let store = SqliteLedgerStore::in_memory(WalletConfig::default_test().store).unwrap();
    store.migrate().unwrap();
    (engine_on(store, clock.clone()), clock)
}

fn receipt() -> ReceiptRef {
    ReceiptRef::new("https://blobs.example.com/receipts/r.jpg", "r.jpg")
}

#[test]
fn migrate_is_idempotent() {
    let store = SqliteLedgerStore::in_memory(WalletConfig::default_test().store).unwrap();
    store.migrate().unwrap();
    store.migrate().unwrap();
    let count = store
        .run_atomic(|tx| tx.user_transaction_count("nobody"))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn full_flow_round_trips_through_sqlite() {
    let (engine, clock) = build_in_memory();

    engine.initialize_balance("rider-1").unwrap();
    let r = engine
        .create_recharge("rider-1", 2_500, receipt(), Some("SINPE-1".into()))
        .unwrap();
    assert_eq!(engine.recharges.get_recharge(&r.id).unwrap(), r);

    clock.advance(Duration::minutes(30));
    let approval = engine.approve(&r.id, "admin-1", Some("ok".into())).unwrap();
    clock.advance(Duration::minutes(30));
    let hold = engine.hold_funds_for_trip("rider-1", "trip-1", 700).unwrap();
    assert_eq!(hold.tier, Tier::NoValidation);

    let stored = engine.recharges.get_recharge(&r.id).unwrap();
    assert_eq!(stored, approval.recharge);
    assert_eq!(stored.status, RechargeStatus::Approved);

    let rows = engine.get_user_transactions("rider-1", 10).unwrap();
    assert_eq!(rows, vec![hold.transaction.clone(), approval.transaction.clone()]);
    assert_eq!(rows[0].kind, TransactionKind::TripHold);
    assert!(rows[0].flag(TAG_NO_VALIDATION_TRIP));
    assert_eq!(rows[1].metadata[TAG_RECHARGE_ID], serde_json::json!(r.id));

    assert_eq!(engine.get_user_transactions("rider-1", 1).unwrap().len(), 1);
    assert_eq!(engine.get_all_transactions(10).unwrap().len(), 2);

    let account = engine.get_balance("rider-1").unwrap().unwrap();
    assert_eq!(account, hold.account);
    assert_eq!(account.balance, 1_800);

    let stats = engine.get_stats("rider-1").unwrap();
    assert_eq!(stats.total_transactions, 2);
    assert_eq!(stats.last_recharge, approval.recharge.reviewed_at);
}

#[test]
fn distributions_round_trip_through_sqlite() {
    let (engine, clock) = build_in_memory();
    let d = engine.schedule("kommuter-1", "trip-1", 900).unwrap();
    assert_eq!(engine.distributions.get_distribution(&d.id).unwrap(), d);

    let due = engine.list_due(d.scheduled_for).unwrap();
    assert_eq!(due, vec![d.clone()]);
    assert!(engine
        .list_due(d.scheduled_for - Duration::milliseconds(1))
        .unwrap()
        .is_empty());

    clock.set(d.scheduled_for + Duration::minutes(3));
    engine.mark_processing(&d.id).unwrap();
    let done = engine.mark_completed(&d.id, "REF-9").unwrap();
    assert_eq!(engine.distributions.get_distribution(&d.id).unwrap(), done);
    assert_eq!(done.status, DistributionStatus::Completed);
    assert_eq!(
        engine.distributions.kommuter_distributions("kommuter-1").unwrap(),
        vec![done]
    );
}

#[test]
fn failed_unit_rolls_back_in_sqlite() {
    let (engine, _) = build_in_memory();
    engine.initialize_balance("rider-1").unwrap();
    let events = engine.recent_events(100).unwrap().len();

    assert!(matches!(
        engine.hold_funds_for_trip("rider-1", "trip-1", 10),
        Err(WalletError::InsufficientBalance { .. })
    ));
    assert_eq!(engine.get_balance("rider-1").unwrap().unwrap().total_trips_completed, 0);
    assert_eq!(engine.recent_events(100).unwrap().len(), events);
}

#[test]
fn state_survives_reopen() {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = TempDb::new();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 8, 20, 17, 30, 0).unwrap(),
    ));

    let recharge_id = {
        let store = SqliteLedgerStore::open(&db.0, WalletConfig::default_test().store).unwrap();
        store.migrate().unwrap();
        let engine = engine_on(store, clock.clone());
        let r = engine.create_recharge("rider-1", 4_000, receipt(), None).unwrap();
        engine.approve(&r.id, "admin-1", None).unwrap();
        engine.create_recharge("rider-1", 100, receipt(), None).unwrap();
        r.id
    };

    let store = SqliteLedgerStore::open(&db.0, WalletConfig::default_test().store).unwrap();
    store.migrate().unwrap();
    let engine = engine_on(store, clock);

    assert_eq!(engine.get_balance("rider-1").unwrap().unwrap().balance, 4_000);
    assert_eq!(engine.list_pending().unwrap().len(), 1);
    assert!(matches!(
        engine.approve(&recharge_id, "admin-2", None),
        Err(WalletError::AlreadyReviewed { .. })
    ));

    let events = engine.recent_events(10).unwrap();
    assert_eq!(events.len(), 4);
    assert!(matches!(
        &events[1],
        WalletEvent::RechargeApproved { recharge_id: id, amount: 4_000, .. } if *id == recharge_id
    ));
    assert!(matches!(
        &events[2],
        WalletEvent::AccountInitialized { user_id } if user_id == "rider-1"
    ));
}

#[test]
fn reads_do_not_wait_for_an_open_write() {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = TempDb::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 20, 17, 30, 0).unwrap());
    let writer = SqliteLedgerStore::open(&db.0, WalletConfig::default_test().store).unwrap();
    writer.migrate().unwrap();
    // One attempt and no busy wait: any lock conflict fails the read outright.
    let reader = SqliteLedgerStore::open(
        &db.0,
        StoreConfig {
            max_attempts: 1,
            backoff_base_ms: 0,
            busy_timeout_ms: 0,
        },
    )
    .unwrap();

    let account = WalletAccount::empty("rider-1", clock.now());
    let seen_mid_write = writer
        .run_atomic(|tx| {
            tx.save_account(&account)?;
            reader.read_only(|r| r.account("rider-1"))
        })
        .unwrap();

    assert!(seen_mid_write.is_none(), "uncommitted write leaked to the reader");
    let seen_after = reader.read_only(|r| r.account("rider-1")).unwrap();
    assert_eq!(seen_after, Some(account));
}
