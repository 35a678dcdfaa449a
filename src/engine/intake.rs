//! Bet intake.
//!
//! Validation is short-circuiting and runs in a fixed order: selection,
//! amount, round open, user standing, balance. The admission guard taken at
//! the "round open" step is held until the bet row is written, so a bet is
//! either captured by the period it was tagged with or refused.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::ledger_rejection;
use super::round::RoundEngine;
use crate::notify::Notifier;
use crate::storage::{bounded, Ledger};
use crate::types::{
    BalanceUpdate, BetId, BetResponse, BetSelection, NewBet, Rejection, ServerMessage, UserId,
    UserStatus,
};

/// An untrusted bet request as it arrives from a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BetRequest {
    pub user_id: UserId,
    pub kind: String,
    pub value: String,
    /// `None` when the client sent something that is not an integer.
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetReceipt {
    pub bet_id: BetId,
    pub period: String,
    pub new_balance: i64,
}

pub struct BetIntake {
    engine: Arc<RoundEngine>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl BetIntake {
    pub fn new(
        engine: Arc<RoundEngine>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            ledger,
            notifier,
            timeout,
        }
    }

    pub async fn place_bet(
        &self,
        user_id: UserId,
        kind: &str,
        value: &str,
        amount: i64,
    ) -> Result<BetReceipt, Rejection> {
        self.place(BetRequest {
            user_id,
            kind: kind.to_string(),
            value: value.to_string(),
            amount: Some(amount),
        })
        .await
    }

    /// Admit a bet and tell the bettor's connections how it went.
    pub async fn place(&self, request: BetRequest) -> Result<BetReceipt, Rejection> {
        let result = self.admit(&request).await;

        match &result {
            Ok(receipt) => {
                info!(
                    user_id = request.user_id,
                    bet_id = receipt.bet_id,
                    period = %receipt.period,
                    kind = %request.kind,
                    value = %request.value,
                    amount = request.amount.unwrap_or_default(),
                    "Bet placed"
                );
                self.notifier.notify_user(
                    request.user_id,
                    ServerMessage::BalanceUpdate(BalanceUpdate {
                        new_balance: receipt.new_balance,
                    }),
                );
                self.notifier.notify_user(
                    request.user_id,
                    ServerMessage::BetOutcome(BetResponse {
                        success: true,
                        code: None,
                        message: "Bet placed successfully".into(),
                        new_balance: Some(receipt.new_balance),
                    }),
                );
            }
            Err(rejection) => {
                debug!(user_id = request.user_id, code = %rejection.code, "Bet rejected");
                self.notifier.notify_user(
                    request.user_id,
                    ServerMessage::BetOutcome(BetResponse {
                        success: false,
                        code: Some(rejection.code),
                        message: rejection.message.clone(),
                        new_balance: None,
                    }),
                );
            }
        }
        result
    }

    async fn admit(&self, request: &BetRequest) -> Result<BetReceipt, Rejection> {
        let selection = BetSelection::parse(&request.kind, &request.value)
            .ok_or_else(Rejection::invalid_kind_value)?;
        let amount = request
            .amount
            .filter(|a| *a > 0)
            .ok_or_else(Rejection::invalid_amount)?;

        let round = self
            .engine
            .admission()
            .await
            .ok_or_else(Rejection::round_closed)?;

        let user = bounded(self.timeout, self.ledger.get_user(request.user_id))
            .await
            .map_err(|e| ledger_rejection(e, "get_user"))?
            .ok_or_else(Rejection::unknown_user)?;
        if user.status != UserStatus::Active {
            return Err(Rejection::user_banned(user.status.reason()));
        }
        if user.balance < amount {
            return Err(Rejection::insufficient_balance());
        }

        let (bet, new_balance) = bounded(
            self.timeout,
            self.ledger.create_bet(NewBet {
                user_id: user.id,
                period: round.period.clone(),
                selection,
                amount,
            }),
        )
        .await
        .map_err(|e| ledger_rejection(e, "create_bet"))?;
        drop(round);

        Ok(BetReceipt {
            bet_id: bet.id,
            period: bet.period,
            new_balance,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
