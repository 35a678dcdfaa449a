//! Reconciliation sweep.
//!
//! Finds bets still pending for any period other than the live one and
//! resolves them. If the period's round was recorded, the bets settle
//! against it. If not (the process died, or the round write failed before
//! anything was announced), a fresh outcome is drawn and recorded first.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::settlement::SettlementProcessor;
use crate::storage::{bounded, Ledger, LedgerError};
use crate::types::{OutcomeValue, Round};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub periods_examined: usize,
    /// Periods whose round already existed.
    pub rounds_recovered: usize,
    /// Periods that needed a new draw.
    pub rounds_redrawn: usize,
    pub bets_settled: usize,
    /// Periods that could not be fully resolved this pass.
    pub failures: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    settlement: SettlementProcessor,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn Ledger>, settlement: SettlementProcessor, timeout: Duration) -> Self {
        Self {
            ledger,
            settlement,
            timeout,
        }
    }

    /// Resolve pending bets of every period except `live_period`.
    ///
    /// `draw` supplies outcomes for periods that have no recorded round.
    pub async fn sweep<F>(
        &self,
        live_period: Option<&str>,
        mut draw: F,
    ) -> Result<ReconcileReport, LedgerError>
    where
        F: FnMut() -> OutcomeValue,
    {
        let periods = bounded(self.timeout, self.ledger.get_pending_periods()).await?;
        let mut report = ReconcileReport::default();

        for period in periods {
            if live_period == Some(period.as_str()) {
                continue;
            }
            report.periods_examined += 1;

            let round = match self.round_for(&period, &mut draw, &mut report).await {
                Ok(round) => round,
                Err(e) => {
                    error!(%period, error = %e, "Could not resolve round for pending bets");
                    report.failures += 1;
                    continue;
                }
            };

            match self.settlement.settle(&round).await {
                Ok(settled) => {
                    report.bets_settled += settled.winners + settled.losers;
                    if !settled.is_complete() {
                        report.failures += 1;
                    }
                }
                Err(e) => {
                    error!(%period, error = %e, "Reconciliation settlement failed");
                    report.failures += 1;
                }
            }
        }

        if report.periods_examined > 0 {
            info!(
                periods = report.periods_examined,
                recovered = report.rounds_recovered,
                redrawn = report.rounds_redrawn,
                bets = report.bets_settled,
                failures = report.failures,
                "Reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    async fn round_for<F>(
        &self,
        period: &str,
        draw: &mut F,
        report: &mut ReconcileReport,
    ) -> Result<Round, LedgerError>
    where
        F: FnMut() -> OutcomeValue,
    {
        if let Some(round) = bounded(self.timeout, self.ledger.get_round_by_period(period)).await? {
            report.rounds_recovered += 1;
            return Ok(round);
        }

        let outcome = draw();
        warn!(%period, %outcome, "No round recorded for period with pending bets, drawing now");
        match bounded(self.timeout, self.ledger.create_round(period, outcome)).await {
            Ok(round) => {
                report.rounds_redrawn += 1;
                Ok(round)
            }
            // Recorded by a write that outlived its timeout.
            Err(LedgerError::DuplicatePeriod(_)) => {
                report.rounds_recovered += 1;
                bounded(self.timeout, self.ledger.get_round_by_period(period))
                    .await?
                    .ok_or_else(|| LedgerError::Corrupt(format!("round {period} vanished")))
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
