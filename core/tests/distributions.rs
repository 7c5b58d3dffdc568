//! Distribution scheduler tests.
//!
//! Covers: settlement slot selection around the 13:00 local cutoff,
//! the batch worker's due query, and the payout lifecycle including
//! refused transitions out of terminal states.

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use std::sync::Arc;
use wallet_core::{
    clock::{ManualClock, WalletClock},
    models::DistributionStatus,
    store::MemoryLedgerStore,
    WalletEngine, WalletError,
};

/// 2024-07-10 at the given Costa Rica (UTC-6) wall-clock time.
fn local(h: u32, m: u32) -> DateTime<Utc> {
    FixedOffset::west_opt(6 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 7, 10, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn build() -> (WalletEngine<MemoryLedgerStore>, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(local(9, 0)));
    let engine = WalletEngine::build_test(clock.clone()).expect("build test engine");
    (engine, clock)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn cutoff_boundaries() {
    let (engine, clock) = build();
    let today = local(13, 0);
    let tomorrow = today + Duration::days(1);

    for (at, expected) in [
        (local(12, 59), today),
        (local(13, 0), today),
        (local(13, 1), tomorrow),
        (local(23, 59), tomorrow),
        (local(0, 5), today),
    ] {
        clock.set(at);
        let d = engine.schedule("kommuter-1", "trip-1", 1_500).unwrap();
        assert_eq!(d.scheduled_for, expected, "requested at {at}");
        assert_eq!(d.created_at, at);
    }
    assert_eq!(today, Utc.with_ymd_and_hms(2024, 7, 10, 19, 0, 0).unwrap());
}

#[test]
fn scheduled_distribution_starts_pending() {
    let (engine, _) = build();
    let d = engine.schedule("kommuter-1", "trip-7", 2_000).unwrap();

    assert_eq!(d.status, DistributionStatus::Pending);
    assert_eq!((d.kommuter_id.as_str(), d.trip_id.as_str(), d.amount), ("kommuter-1", "trip-7", 2_000));
    assert!(d.processed_at.is_none() && d.sinpe_reference.is_none() && d.failure_reason.is_none());
    assert_eq!(engine.distributions.get_distribution(&d.id).unwrap(), d);
}

#[test]
fn non_positive_payouts_are_refused() {
    let (engine, _) = build();
    for amount in [0, -10] {
        assert!(matches!(
            engine.schedule("kommuter-1", "trip-1", amount),
            Err(WalletError::InvalidAmount { .. })
        ));
    }
    assert!(engine.distributions.kommuter_distributions("kommuter-1").unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Due query
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn list_due_filters_by_slot_and_status() {
    let (engine, clock) = build();
    clock.set(local(14, 0));
    let tomorrow = engine.schedule("kommuter-1", "trip-b", 200).unwrap();
    clock.set(local(10, 0));
    let today = engine.schedule("kommuter-2", "trip-a", 100).unwrap();
    let claimed = engine.schedule("kommuter-3", "trip-c", 300).unwrap();
    engine.mark_processing(&claimed.id).unwrap();

    assert!(engine.list_due(local(12, 59)).unwrap().is_empty());

    let due: Vec<_> = engine
        .list_due(local(13, 0))
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(due, vec![today.id.clone()]);

    let due: Vec<_> = engine
        .list_due(local(13, 0) + Duration::days(2))
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(due, vec![today.id, tomorrow.id], "oldest slot first");
}

#[test]
fn list_due_has_no_side_effects() {
    let (engine, _) = build();
    let d = engine.schedule("kommuter-1", "trip-1", 100).unwrap();
    let at = local(13, 0);
    assert_eq!(engine.list_due(at).unwrap(), engine.list_due(at).unwrap());
    assert_eq!(engine.distributions.get_distribution(&d.id).unwrap().status, DistributionStatus::Pending);
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn processing_then_completed() {
    let (engine, clock) = build();
    let d = engine.schedule("kommuter-1", "trip-1", 1_000).unwrap();

    clock.set(local(13, 2));
    let processing = engine.mark_processing(&d.id).unwrap();
    assert_eq!(processing.status, DistributionStatus::Processing);
    assert!(processing.processed_at.is_none());
    assert!(engine.list_due(local(13, 5)).unwrap().is_empty(), "claimed work is not due");

    clock.set(local(13, 5));
    let done = engine.mark_completed(&d.id, "SINPE-OUT-991").unwrap();
    assert_eq!(done.status, DistributionStatus::Completed);
    assert_eq!(done.processed_at, Some(clock.now()));
    assert_eq!(done.sinpe_reference.as_deref(), Some("SINPE-OUT-991"));
    assert!(done.failure_reason.is_none());
    assert_eq!(engine.distributions.get_distribution(&d.id).unwrap(), done);
}

#[test]
fn pending_can_fail_directly() {
    let (engine, clock) = build();
    let d = engine.schedule("kommuter-1", "trip-1", 1_000).unwrap();
    clock.set(local(13, 1));

    let failed = engine.mark_failed(&d.id, "destination account closed").unwrap();
    assert_eq!(failed.status, DistributionStatus::Failed);
    assert_eq!(failed.processed_at, Some(local(13, 1)));
    assert_eq!(failed.failure_reason.as_deref(), Some("destination account closed"));
    assert!(failed.sinpe_reference.is_none());
}

#[test]
fn terminal_states_are_final() {
    let (engine, _) = build();
    let done = engine.schedule("kommuter-1", "trip-1", 1_000).unwrap();
    engine.mark_completed(&done.id, "REF-1").unwrap();
    let failed = engine.schedule("kommuter-1", "trip-2", 1_000).unwrap();
    engine.mark_failed(&failed.id, "timeout").unwrap();

    match engine.mark_failed(&done.id, "late failure") {
        Err(WalletError::InvalidTransition { distribution_id, from, to }) => {
            assert_eq!(distribution_id, done.id);
            assert_eq!((from.as_str(), to.as_str()), ("completed", "failed"));
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
    assert!(matches!(
        engine.mark_completed(&failed.id, "REF-2"),
        Err(WalletError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.mark_processing(&done.id),
        Err(WalletError::InvalidTransition { .. })
    ));

    let stored = engine.distributions.get_distribution(&done.id).unwrap();
    assert_eq!(stored.sinpe_reference.as_deref(), Some("REF-1"));
}

#[test]
fn processing_cannot_be_claimed_twice() {
    let (engine, _) = build();
    let d = engine.schedule("kommuter-1", "trip-1", 1_000).unwrap();
    engine.mark_processing(&d.id).unwrap();
    assert!(matches!(
        engine.mark_processing(&d.id),
        Err(WalletError::InvalidTransition { .. })
    ));
}

#[test]
fn unknown_distribution_is_not_found() {
    let (engine, _) = build();
    for result in [
        engine.mark_processing("nope"),
        engine.mark_completed("nope", "REF"),
        engine.mark_failed("nope", "reason"),
        engine.distributions.get_distribution("nope"),
    ] {
        assert!(matches!(result, Err(WalletError::NotFound { entity: "distribution", .. })));
    }
}

#[test]
fn kommuter_history_is_newest_first() {
    let (engine, clock) = build();
    let a = engine.schedule("kommuter-1", "trip-a", 100).unwrap();
    clock.advance(Duration::minutes(1));
    let b = engine.schedule("kommuter-1", "trip-b", 200).unwrap();
    engine.schedule("kommuter-2", "trip-c", 300).unwrap();

    let ids: Vec<_> = engine
        .distributions
        .kommuter_distributions("kommuter-1")
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![b.id, a.id]);
}
