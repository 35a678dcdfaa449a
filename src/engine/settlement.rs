//! Settlement processor.
//!
//! Resolves every still-pending bet of a closed round against its outcome.
//! Bets are independent, so they settle concurrently. Each bet's credit and
//! status change commit together in the ledger (`update_bet_outcome`); a bet
//! whose write fails stays pending for the reconciler.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::outcome::{is_winning, multiplier_for, payout_for};
use crate::notify::Notifier;
use crate::storage::{bounded, Ledger, LedgerError, SettleEffect};
use crate::types::{BalanceUpdate, Bet, BetStatus, OutcomeValue, Round, ServerMessage};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Totals for one settlement pass over a round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementReport {
    pub period: String,
    pub bets_seen: usize,
    pub winners: usize,
    pub losers: usize,
    /// Bets another pass finalized first.
    pub already_settled: usize,
    /// Bets left pending because the ledger write failed.
    pub failed: usize,
    pub total_staked: i64,
    pub total_paid: i64,
}

impl SettlementReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// Staked minus paid, over the bets settled in this pass.
    pub fn house_net(&self) -> i64 {
        self.total_staked - self.total_paid
    }
}

enum BetSettlement {
    Won { payout: i64 },
    Lost,
    AlreadySettled,
    Failed,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SettlementProcessor {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl SettlementProcessor {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            ledger,
            notifier,
            timeout,
        }
    }

    /// Settle all pending bets of `round`. Running it again for the same
    /// round finds nothing pending and changes nothing.
    ///
    /// Fails only if the pending bets cannot be fetched; per-bet failures
    /// are counted in the report.
    pub async fn settle(&self, round: &Round) -> Result<SettlementReport, LedgerError> {
        let bets = bounded(self.timeout, self.ledger.get_pending_bets(&round.period)).await?;

        let mut report = SettlementReport {
            period: round.period.clone(),
            bets_seen: bets.len(),
            ..SettlementReport::default()
        };
        if bets.is_empty() {
            debug!(period = %round.period, "No pending bets to settle");
            return Ok(report);
        }

        let results = join_all(bets.iter().map(|bet| self.settle_bet(bet, round.outcome))).await;

        for (bet, result) in bets.iter().zip(results) {
            match result {
                BetSettlement::Won { payout } => {
                    report.winners += 1;
                    report.total_staked += bet.amount;
                    report.total_paid += payout;
                }
                BetSettlement::Lost => {
                    report.losers += 1;
                    report.total_staked += bet.amount;
                }
                BetSettlement::AlreadySettled => report.already_settled += 1,
                BetSettlement::Failed => report.failed += 1,
            }
        }

        info!(
            period = %report.period,
            outcome = %round.outcome,
            color = %round.color(),
            size = %round.size(),
            bets = report.bets_seen,
            winners = report.winners,
            losers = report.losers,
            failed = report.failed,
            staked = report.total_staked,
            paid = report.total_paid,
            net = report.house_net(),
            "Round settled"
        );
        Ok(report)
    }

    async fn settle_bet(&self, bet: &Bet, outcome: OutcomeValue) -> BetSettlement {
        let won = is_winning(&bet.selection, outcome);
        let payout = payout_for(&bet.selection, bet.amount, outcome);
        let status = if won { BetStatus::Won } else { BetStatus::Lost };

        let effect = bounded(
            self.timeout,
            self.ledger.update_bet_outcome(bet.id, status, payout),
        )
        .await;

        match effect {
            Ok(SettleEffect::Settled { credited_balance }) => {
                if let Some(new_balance) = credited_balance {
                    self.notifier.notify_user(
                        bet.user_id,
                        ServerMessage::BalanceUpdate(BalanceUpdate { new_balance }),
                    );
                }
                debug!(
                    bet_id = bet.id,
                    user_id = bet.user_id,
                    selection = %bet.selection,
                    multiplier = %multiplier_for(&bet.selection).normalize(),
                    payout,
                    "Bet settled"
                );
                if won {
                    BetSettlement::Won { payout }
                } else {
                    BetSettlement::Lost
                }
            }
            Ok(SettleEffect::AlreadySettled) => {
                debug!(bet_id = bet.id, "Bet already settled, skipping");
                BetSettlement::AlreadySettled
            }
            Err(e) => {
                error!(bet_id = bet.id, period = %bet.period, error = %e, "Bet settlement failed, left pending");
                BetSettlement::Failed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
