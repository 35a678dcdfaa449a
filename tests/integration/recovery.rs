//! Failure and restart handling: lost round writes, failed settlements,
//! outages during admission, late bet commits, and a process that dies
//! mid-round.

use std::sync::Arc;
use std::time::Duration;

use colorgame::engine::BetIntake;
use colorgame::notify::Notifier;
use colorgame::storage::{Ledger, MemoryLedger};
use colorgame::types::*;

use crate::flaky_ledger::FlakyLedger;
use crate::{assert_conserved, Harness};

#[tokio::test]
async fn test_transient_round_write_is_retried() {
    let ledger = Arc::new(FlakyLedger::new());
    let user = ledger.create_user("p", 100).await.unwrap();
    let h = Harness::new(ledger.clone(), 60, vec![7]).await;

    h.intake.place_bet(user.id, "color", "green", 10).await.unwrap();
    ledger.fail_next_rounds(2);
    let (closed, _) = h.close_round().await;

    assert!(h.ledger.get_round_by_period(&closed).await.unwrap().is_some());
    assert!(h.ledger.get_pending_bets(&closed).await.unwrap().is_empty());
    assert_eq!(h.balance(user.id).await, 110);
    assert!(!h.engine.sweep_pending());
}

#[tokio::test]
async fn test_lost_round_write_is_recorded_by_sweep() {
    let ledger = Arc::new(FlakyLedger::new());
    let user = ledger.create_user("p", 100).await.unwrap();
    let h = Harness::new(ledger.clone(), 60, vec![3, 8]).await;

    h.intake.place_bet(user.id, "size", "small", 10).await.unwrap();
    // Every attempt for this close fails, so the draw of 3 is never announced.
    ledger.fail_next_rounds(3);
    let (lost, after_lost) = h.close_round().await;
    assert!(after_lost.betting_open);
    assert_ne!(after_lost.period, lost);
    assert!(after_lost.recent_rounds.iter().all(|r| r.period != lost));

    // The sweep that follows the close writes the outcome drawn at close.
    let recovered = h.ledger.get_round_by_period(&lost).await.unwrap().unwrap();
    assert_eq!(recovered.outcome.get(), 3);
    assert!(h.ledger.get_pending_periods().await.unwrap().is_empty());
    assert!(!h.engine.sweep_pending());

    let bet = &h.ledger.get_bets_by_period(&lost).await.unwrap()[0];
    assert_eq!(bet.status, BetStatus::Won);
    assert_eq!(h.balance(user.id).await, 110);

    let snapshot = h.engine.snapshot().await;
    assert!(snapshot.recent_rounds.iter().any(|r| r.period == lost));
    assert_conserved(h.ledger.as_ref()).await;
}

#[tokio::test]
async fn test_lost_round_without_bets_is_kept_until_recorded() {
    let ledger = Arc::new(FlakyLedger::new());
    let h = Harness::new(ledger.clone(), 60, vec![5, 1]).await;

    // Three attempts during the close and the retry in its sweep all fail.
    ledger.fail_next_rounds(4);
    let (lost, _) = h.close_round().await;
    assert!(h.ledger.get_round_by_period(&lost).await.unwrap().is_none());
    assert!(h.engine.sweep_pending());

    let (next, _) = h.close_round().await;
    let recorded = h.ledger.get_round_by_period(&lost).await.unwrap().unwrap();
    assert_eq!(recorded.outcome.get(), 5);
    assert!(h.ledger.get_round_by_period(&next).await.unwrap().is_some());
    assert!(!h.engine.sweep_pending());

    let periods: Vec<String> = h
        .engine
        .snapshot()
        .await
        .recent_rounds
        .into_iter()
        .map(|r| r.period)
        .collect();
    assert_eq!(periods, vec![next, lost]);
}

#[tokio::test]
async fn test_bet_committed_after_timeout_is_settled() {
    let ledger = Arc::new(FlakyLedger::new());
    let user = ledger.create_user("p", 1_000).await.unwrap();
    let h = Harness::new(ledger.clone(), 60, vec![2]).await;
    let notifier: Arc<dyn Notifier> = h.hub.clone();
    let impatient = BetIntake::new(h.engine.clone(), h.ledger.clone(), notifier, Duration::from_millis(50));

    ledger.delay_bet_commits(Duration::from_millis(150));
    let err = impatient.place_bet(user.id, "color", "red", 200).await.unwrap_err();
    assert_eq!(err.code, RejectionCode::Unavailable);

    // The round closes before the write lands, so its settlement misses it.
    let (closed, _) = h.close_round().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.ledger.get_pending_bets(&closed).await.unwrap().len(), 1);
    assert_eq!(h.balance(user.id).await, 800);

    // The next close settles it against the recorded outcome.
    h.close_round().await;
    assert!(h.ledger.get_pending_periods().await.unwrap().is_empty());
    let bet = &h.ledger.get_bets_by_period(&closed).await.unwrap()[0];
    assert_eq!(bet.status, BetStatus::Won);
    assert_eq!(bet.payout, 400);
    assert_eq!(h.balance(user.id).await, 1_200);
    assert_conserved(h.ledger.as_ref()).await;
}

#[tokio::test]
async fn test_failed_bet_settlement_stays_pending_then_settles_once() {
    let ledger = Arc::new(FlakyLedger::new());
    let a = ledger.create_user("a", 100).await.unwrap();
    let b = ledger.create_user("b", 100).await.unwrap();
    let h = Harness::new(ledger.clone(), 60, vec![0]).await;

    h.intake.place_bet(a.id, "color", "violet", 10).await.unwrap();
    h.intake.place_bet(b.id, "color", "violet", 10).await.unwrap();
    ledger.fail_next_settlements(1);
    let (closed, _) = h.close_round().await;

    // One of the two writes failed and was swept right after the close,
    // against the round already recorded for that period.
    assert!(h.ledger.get_pending_bets(&closed).await.unwrap().is_empty());
    let bets = h.ledger.get_bets_by_period(&closed).await.unwrap();
    assert!(bets.iter().all(|bet| bet.status == BetStatus::Won && bet.payout == 45));
    assert_eq!(h.balance(a.id).await, 135);
    assert_eq!(h.balance(b.id).await, 135);
    assert_eq!(h.ledger.get_recent_rounds(10).await.unwrap().len(), 1);
    assert_conserved(h.ledger.as_ref()).await;
}

#[tokio::test]
async fn test_outage_during_admission_is_unavailable_and_atomic() {
    let ledger = Arc::new(FlakyLedger::new());
    let user = ledger.create_user("p", 100).await.unwrap();
    let h = Harness::new(ledger.clone(), 60, vec![1]).await;

    ledger.set_outage(true);
    let err = h.intake.place_bet(user.id, "color", "red", 10).await.unwrap_err();
    assert_eq!(err.code, RejectionCode::Unavailable);
    assert!(!err.message.to_lowercase().contains("timed out"));
    ledger.set_outage(false);

    assert_eq!(h.balance(user.id).await, 100);
    assert!(h.ledger.get_user_transactions(user.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_outage_during_close_still_advances() {
    let ledger = Arc::new(FlakyLedger::new());
    let user = ledger.create_user("p", 100).await.unwrap();
    let h = Harness::new(ledger.clone(), 60, vec![2]).await;
    h.intake.place_bet(user.id, "color", "red", 10).await.unwrap();

    ledger.set_outage(true);
    let (lost, next) = h.close_round().await;
    assert!(next.betting_open);
    assert_ne!(next.period, lost);
    assert!(h.engine.sweep_pending());
    ledger.set_outage(false);

    h.close_round().await;
    assert!(h.ledger.get_pending_periods().await.unwrap().is_empty());
    assert!(h.ledger.get_round_by_period(&lost).await.unwrap().is_some());
    assert_eq!(h.balance(user.id).await, 110);
    assert_conserved(h.ledger.as_ref()).await;
}

#[tokio::test]
async fn test_restart_settles_bets_of_a_dead_process() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let user = ledger.create_user("p", 1_000).await.unwrap();

    // First process: bets placed, then it dies before the window closes.
    let dead_period = {
        let h = Harness::new(ledger.clone(), 60, vec![4]).await;
        let receipt = h.intake.place_bet(user.id, "number", "4", 100).await.unwrap();
        h.engine.tick().await;
        receipt.period
    };
    assert_eq!(ledger.get_pending_periods().await.unwrap(), vec![dead_period.clone()]);

    // Second process on the same ledger.
    let h = Harness::new(ledger.clone(), 60, vec![4]).await;
    let live = h.engine.snapshot().await.period;
    assert!(live > dead_period);

    let report = h.engine.reconcile().await.unwrap();
    assert_eq!(report.periods_examined, 1);
    assert_eq!(report.rounds_redrawn, 1);
    assert_eq!(report.bets_settled, 1);

    let round = ledger.get_round_by_period(&dead_period).await.unwrap().unwrap();
    assert_eq!(round.outcome.get(), 4);
    assert_eq!(h.balance(user.id).await, 1_000 - 100 + 900);
    assert!(ledger.get_pending_periods().await.unwrap().is_empty());

    // Snapshot history now includes the recovered round.
    let snapshot = h.engine.snapshot().await;
    assert!(snapshot.recent_rounds.iter().any(|r| r.period == dead_period));
    assert_conserved(ledger.as_ref()).await;
}
