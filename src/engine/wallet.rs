//! Balance operations outside of betting: deposits, withdrawals and
//! operator adjustments. Each is one ledger call that changes the balance
//! and writes its transaction together.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::ledger_rejection;
use crate::notify::Notifier;
use crate::storage::{bounded, Ledger};
use crate::types::{BalanceUpdate, Rejection, ServerMessage, TransactionKind, UserId};

pub struct Wallet {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl Wallet {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            ledger,
            notifier,
            timeout,
        }
    }

    pub async fn deposit(&self, user_id: UserId, amount: i64) -> Result<i64, Rejection> {
        if amount <= 0 {
            return Err(Rejection::invalid_amount());
        }
        self.apply(user_id, amount, TransactionKind::Deposit).await
    }

    pub async fn withdraw(&self, user_id: UserId, amount: i64) -> Result<i64, Rejection> {
        if amount <= 0 {
            return Err(Rejection::invalid_amount());
        }
        self.apply(user_id, -amount, TransactionKind::Withdraw).await
    }

    /// Operator correction. Positive credits, negative debits; zero is refused.
    pub async fn admin_adjust(&self, user_id: UserId, delta: i64) -> Result<i64, Rejection> {
        let kind = match delta {
            0 => return Err(Rejection::invalid_amount()),
            d if d > 0 => TransactionKind::AdminCredit,
            _ => TransactionKind::AdminDebit,
        };
        self.apply(user_id, delta, kind).await
    }

    async fn apply(&self, user_id: UserId, delta: i64, kind: TransactionKind) -> Result<i64, Rejection> {
        let new_balance = bounded(self.timeout, self.ledger.adjust_balance(user_id, delta, kind))
            .await
            .map_err(|e| ledger_rejection(e, kind.as_str()))?;

        info!(user_id, delta, kind = kind.as_str(), new_balance, "Balance adjusted");
        self.notifier.notify_user(
            user_id,
            ServerMessage::BalanceUpdate(BalanceUpdate { new_balance }),
        );
        Ok(new_balance)
    }
}
