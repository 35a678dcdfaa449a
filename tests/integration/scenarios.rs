//! Round lifecycle scenarios over both ledger backends.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use colorgame::engine::SettlementProcessor;
use colorgame::notify::Notifier;
use colorgame::storage::{Ledger, MemoryLedger, SqliteLedger};
use colorgame::types::*;

use crate::{assert_conserved, Harness, TIMEOUT};

async fn sqlite() -> Arc<dyn Ledger> {
    Arc::new(SqliteLedger::in_memory().await.expect("sqlite opens"))
}

fn memory() -> Arc<dyn Ledger> {
    Arc::new(MemoryLedger::new())
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

async fn red_bet_wins(ledger: Arc<dyn Ledger>) {
    let user = ledger.create_user("player", 1_000).await.unwrap();
    let h = Harness::new(ledger, 60, vec![2]).await;

    let receipt = h.intake.place_bet(user.id, "color", "red", 200).await.unwrap();
    assert_eq!(receipt.new_balance, 800);
    let pending = h.ledger.get_pending_bets(&receipt.period).await.unwrap();
    assert_eq!(pending.len(), 1);

    let (closed, next) = h.close_round().await;
    assert_eq!(closed, receipt.period);
    assert!(next.betting_open);
    assert_eq!(next.recent_rounds[0].color_class, Color::Red);
    assert_eq!(next.recent_rounds[0].size_class, Size::Small);

    let bet = &h.ledger.get_bets_by_period(&closed).await.unwrap()[0];
    assert_eq!(bet.status, BetStatus::Won);
    assert_eq!(bet.payout, 400);
    assert_eq!(h.balance(user.id).await, 1_200);

    let mut log: Vec<(TransactionKind, i64)> = h
        .ledger
        .get_user_transactions(user.id, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.kind, t.amount))
        .collect();
    log.reverse();
    assert_eq!(log, vec![(TransactionKind::Bet, -200), (TransactionKind::Win, 400)]);
    assert_conserved(h.ledger.as_ref()).await;
}

#[tokio::test]
async fn test_end_to_end_memory() {
    red_bet_wins(memory()).await;
}

#[tokio::test]
async fn test_end_to_end_sqlite() {
    red_bet_wins(sqlite().await).await;
}

// ---------------------------------------------------------------------------
// Payout examples
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_payout_examples_outcome_five() {
    let ledger = sqlite().await;
    let user = ledger.create_user("p", 1_000).await.unwrap();
    let h = Harness::new(ledger, 60, vec![5]).await;

    let violet = h.intake.place_bet(user.id, "color", "violet", 100).await.unwrap();
    let number = h.intake.place_bet(user.id, "number", "5", 50).await.unwrap();
    let small = h.intake.place_bet(user.id, "size", "small", 20).await.unwrap();
    h.close_round().await;

    let bets = h.ledger.get_bets_by_period(&violet.period).await.unwrap();
    let by_id = |id: BetId| bets.iter().find(|b| b.id == id).unwrap();
    assert_eq!(by_id(violet.bet_id).is_win(), Some(true));
    assert_eq!(by_id(violet.bet_id).payout, 450);
    assert_eq!(by_id(number.bet_id).payout, 450);
    assert_eq!(by_id(small.bet_id).is_win(), Some(false));
    assert_eq!(by_id(small.bet_id).payout, 0);

    assert_eq!(h.balance(user.id).await, 1_000 - 170 + 900);
    let round = h.ledger.get_round_by_period(&violet.period).await.unwrap().unwrap();
    assert_eq!(round.color(), Color::Violet);
    assert_eq!(round.size(), Size::Big);
}

// ---------------------------------------------------------------------------
// Admission rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_closed_round_rejects_and_keeps_balance() {
    let ledger = memory();
    let user = ledger.create_user("p", 500).await.unwrap();
    let h = Harness::new(ledger, 2, vec![0]).await;

    h.engine.tick().await;
    h.engine.halt_betting().await;

    let err = h.intake.place_bet(user.id, "color", "green", 100).await.unwrap_err();
    assert_eq!(err.code, RejectionCode::RoundClosed);
    assert_eq!(h.balance(user.id).await, 500);
    assert!(h.ledger.get_user_transactions(user.id, 10).await.unwrap().is_empty());
}

async fn race_for_balance(ledger: Arc<dyn Ledger>) {
    let user = ledger.create_user("racer", 1_000).await.unwrap();
    let h = Harness::new(ledger, 60, vec![1]).await;
    let user_id = user.id;

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let intake = h.intake.clone();
            let color = if i % 2 == 0 { "red" } else { "green" };
            tokio::spawn(async move { intake.place_bet(user_id, "color", color, 200).await })
        })
        .collect();

    let mut accepted = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(r) => {
                assert_eq!(r.code, RejectionCode::InsufficientBalance);
                refused += 1;
            }
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(refused, 5);
    assert_eq!(h.balance(user.id).await, 0);
    assert_conserved(h.ledger.as_ref()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_admission_memory() {
    race_for_balance(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_admission_sqlite() {
    race_for_balance(sqlite().await).await;
}

#[tokio::test]
async fn test_two_bets_jointly_over_balance() {
    let ledger = memory();
    let user = ledger.create_user("pair", 100).await.unwrap();
    let h = Harness::new(ledger, 60, vec![1]).await;

    let (a, b) = tokio::join!(
        h.intake.place_bet(user.id, "size", "big", 70),
        h.intake.place_bet(user.id, "size", "small", 70),
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let refused = a.err().or(b.err()).unwrap();
    assert_eq!(refused.code, RejectionCode::InsufficientBalance);
    assert_eq!(h.balance(user.id).await, 30);
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_resettling_a_period_is_a_no_op() {
    let ledger = sqlite().await;
    let user = ledger.create_user("p", 1_000).await.unwrap();
    let h = Harness::new(ledger, 60, vec![9]).await;

    h.intake.place_bet(user.id, "number", "9", 10).await.unwrap();
    h.intake.place_bet(user.id, "color", "red", 10).await.unwrap();
    let (closed, _) = h.close_round().await;
    let balance = h.balance(user.id).await;
    assert_eq!(balance, 1_000 - 20 + 90);

    let notifier: Arc<dyn Notifier> = h.hub.clone();
    let processor = SettlementProcessor::new(h.ledger.clone(), notifier, TIMEOUT);
    let round = h.ledger.get_round_by_period(&closed).await.unwrap().unwrap();
    let report = processor.settle(&round).await.unwrap();
    assert_eq!(report.bets_seen, 0);
    assert_eq!(report.total_paid, 0);

    let reconciled = h.engine.reconcile().await.unwrap();
    assert_eq!(reconciled.periods_examined, 0);
    assert_eq!(h.balance(user.id).await, balance);
    assert_conserved(h.ledger.as_ref()).await;
}

async fn many_rounds_conserve(ledger: Arc<dyn Ledger>) {
    let mut ids = Vec::new();
    for name in ["ana", "ben", "cai", "dee"] {
        ids.push(ledger.create_user(name, 300).await.unwrap().id);
    }
    let h = Harness::new(ledger, 60, vec![0, 3, 5, 8, 2, 9, 6, 1, 4, 7]).await;
    let mut rng = StdRng::seed_from_u64(7);
    let kinds = [
        ("color", "green"),
        ("color", "violet"),
        ("color", "red"),
        ("number", "5"),
        ("number", "0"),
        ("size", "big"),
        ("size", "Small"),
    ];

    for _round in 0..12 {
        for _ in 0..8 {
            let user = ids[rng.gen_range(0..ids.len())];
            match rng.gen_range(0..10) {
                0 => {
                    let _ = h.wallet.deposit(user, rng.gen_range(1..50)).await;
                }
                1 => {
                    let _ = h.wallet.withdraw(user, rng.gen_range(1..80)).await;
                }
                _ => {
                    let (kind, value) = kinds[rng.gen_range(0..kinds.len())];
                    let _ = h.intake.place_bet(user, kind, value, rng.gen_range(1..120)).await;
                }
            }
        }
        h.close_round().await;
        assert_conserved(h.ledger.as_ref()).await;
    }

    assert!(h.ledger.get_pending_periods().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conservation_over_many_rounds_memory() {
    many_rounds_conserve(memory()).await;
}

#[tokio::test]
async fn test_conservation_over_many_rounds_sqlite() {
    many_rounds_conserve(sqlite().await).await;
}

// ---------------------------------------------------------------------------
// Bets racing the window close
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bets_racing_close_are_never_lost() {
    let ledger = memory();
    let user = ledger.create_user("fast", 100_000).await.unwrap();
    let h = Harness::new(ledger, 60, vec![4]).await;
    let user_id = user.id;

    let bettors: Vec<_> = (0..200)
        .map(|_| {
            let intake = h.intake.clone();
            tokio::spawn(async move { intake.place_bet(user_id, "size", "small", 1).await })
        })
        .collect();
    let (closed, next) = h.close_round().await;

    let mut accepted = Vec::new();
    for task in bettors {
        match task.await.unwrap() {
            Ok(receipt) => accepted.push(receipt),
            Err(r) => assert_eq!(r.code, RejectionCode::RoundClosed),
        }
    }

    // Bets tagged with the closed period were all settled by it; any later
    // ones wait for the next round. Nothing is pending for a closed period.
    let pending = h.ledger.get_pending_periods().await.unwrap();
    assert!(pending.iter().all(|p| *p == next.period));
    for receipt in &accepted {
        assert!(receipt.period == closed || receipt.period == next.period);
    }
    let settled = h.ledger.get_bets_by_period(&closed).await.unwrap();
    assert!(settled.iter().all(|b| b.status == BetStatus::Won && b.payout == 2));
    assert_conserved(h.ledger.as_ref()).await;
}

// ---------------------------------------------------------------------------
// History and fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_history_is_newest_first_and_unique() {
    let h = Harness::new(sqlite().await, 60, vec![1, 2, 3]).await;
    let mut closed = Vec::new();
    for _ in 0..6 {
        closed.push(h.close_round().await.0);
    }

    let recent = h.ledger.get_recent_rounds(4).await.unwrap();
    assert_eq!(recent.len(), 4);
    for pair in recent.windows(2) {
        assert!(pair[0].id > pair[1].id);
        assert!(pair[0].period > pair[1].period);
    }
    assert_eq!(recent[0].period, *closed.last().unwrap());

    let all = h.ledger.get_recent_rounds(100).await.unwrap();
    let unique: HashSet<_> = all.iter().map(|r| r.period.clone()).collect();
    assert_eq!(unique.len(), 6);
    for round in &all {
        assert_eq!(RoundResult::from(round).color_class, round.outcome.color());
    }
}

#[tokio::test]
async fn test_stalled_subscriber_does_not_block_ticks() {
    let h = Harness::new(memory(), 3, vec![6]).await;
    let _stalled = h.engine.subscribe(Uuid::new_v4(), None).await;
    let mut live = h.engine.subscribe(Uuid::new_v4(), Some(1)).await;

    let ticks = async {
        for _ in 0..2_000 {
            h.engine.tick().await;
            while live.try_recv().is_ok() {}
        }
    };
    tokio::time::timeout(Duration::from_secs(10), ticks)
        .await
        .expect("ticks never block on a slow client");

    // The stalled connection overflowed its queue and was dropped.
    assert_eq!(h.hub.connection_count(), 1);
}

#[tokio::test]
async fn test_bettor_is_notified_of_balance() {
    let ledger = memory();
    let user = ledger.create_user("n", 100).await.unwrap();
    let h = Harness::new(ledger, 60, vec![2]).await;
    let mut rx = h.engine.subscribe(Uuid::new_v4(), Some(user.id)).await;

    h.intake.place_bet(user.id, "color", "red", 40).await.unwrap();
    h.close_round().await;

    let mut balances = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let ServerMessage::BalanceUpdate(update) = msg {
            balances.push(update.new_balance);
        }
    }
    assert_eq!(balances, vec![60, 140]);
}
