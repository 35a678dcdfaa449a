//! Persistence layer: the ledger gateway.
//!
//! `Ledger` is the only way the engine touches users, rounds, bets and
//! transactions. Two implementations ship behind it: `MemoryLedger` for
//! tests and throwaway runs, and `SqliteLedger` for durable deployments.
//!
//! Every balance change goes through an operation that writes the balance
//! and its `Transaction` row as one unit. There is deliberately no way to
//! insert a bare transaction or set a balance without its audit entry.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::types::{
    Bet, BetId, BetStatus, NewBet, OutcomeValue, Round, Transaction, TransactionKind, User,
    UserId, UserStatus,
};

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Bet {0} not found")]
    BetNotFound(BetId),

    #[error("Username already taken: {0}")]
    DuplicateUsername(String),

    #[error("Round for period {0} already recorded")]
    DuplicatePeriod(String),

    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: i64, available: i64 },

    #[error("Invalid ledger operation: {0}")]
    Invalid(String),

    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("Ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    /// Failures where retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout(_) | LedgerError::Database(_))
    }
}

/// What `update_bet_outcome` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleEffect {
    /// The bet left `Pending` in this call. `credited_balance` is the
    /// user's balance after the payout credit, if one was applied.
    Settled { credited_balance: Option<i64> },
    /// The bet was already terminal; nothing changed.
    AlreadySettled,
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Ledger: Send + Sync {
    // -- Users --

    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, LedgerError>;

    /// Create an active user. The initial balance is not a transaction.
    async fn create_user(&self, username: &str, initial_balance: i64) -> Result<User, LedgerError>;

    async fn set_user_status(&self, id: UserId, status: UserStatus) -> Result<User, LedgerError>;

    async fn get_all_users(&self) -> Result<Vec<User>, LedgerError>;

    /// Atomically add `delta` to the balance and record one transaction of
    /// `kind`. Fails with `InsufficientBalance` if the result would be negative.
    /// Returns the new balance.
    async fn adjust_balance(
        &self,
        id: UserId,
        delta: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError>;

    /// Set the balance to `new_balance`, recording the difference as one
    /// transaction of `kind`. A zero difference writes nothing.
    async fn update_balance(
        &self,
        id: UserId,
        new_balance: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError>;

    // -- Rounds --

    /// Append a round. Fails with `DuplicatePeriod` if the period exists.
    async fn create_round(&self, period: &str, outcome: OutcomeValue) -> Result<Round, LedgerError>;

    /// The `limit` most recent rounds, newest first.
    async fn get_recent_rounds(&self, limit: usize) -> Result<Vec<Round>, LedgerError>;

    async fn get_round_by_period(&self, period: &str) -> Result<Option<Round>, LedgerError>;

    /// Count of rounds per outcome value. Every value in the space is present.
    async fn get_outcome_frequency(&self) -> Result<BTreeMap<u8, u64>, LedgerError>;

    // -- Bets --

    /// Admit a bet: debit `amount`, record a `bet` transaction of `-amount`
    /// and insert the pending bet, all or nothing. Returns the bet and the
    /// user's new balance.
    async fn create_bet(&self, bet: NewBet) -> Result<(Bet, i64), LedgerError>;

    async fn get_bets_by_period(&self, period: &str) -> Result<Vec<Bet>, LedgerError>;

    /// Bets for `period` still awaiting settlement, oldest first.
    async fn get_pending_bets(&self, period: &str) -> Result<Vec<Bet>, LedgerError>;

    /// Distinct periods that still have pending bets, oldest first.
    async fn get_pending_periods(&self) -> Result<Vec<String>, LedgerError>;

    /// Finalize a pending bet. For `Won` with a positive payout the credit,
    /// its `win` transaction and the status change commit together. A bet
    /// that is already terminal is left untouched.
    async fn update_bet_outcome(
        &self,
        bet_id: BetId,
        status: BetStatus,
        payout: i64,
    ) -> Result<SettleEffect, LedgerError>;

    /// A user's bets, newest first.
    async fn get_user_bets(&self, user_id: UserId, limit: usize) -> Result<Vec<Bet>, LedgerError>;

    // -- Transactions --

    /// A user's transactions, newest first.
    async fn get_user_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError>;
}

/// Run a ledger call with an upper bound on how long it may take.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| LedgerError::Timeout(limit))?
}

/// Shared argument check for `update_bet_outcome` implementations.
pub(crate) fn check_settlement(status: BetStatus, payout: i64) -> Result<(), LedgerError> {
    match status {
        BetStatus::Pending => Err(LedgerError::Invalid("cannot settle a bet to pending".into())),
        BetStatus::Lost if payout != 0 => {
            Err(LedgerError::Invalid(format!("lost bet cannot pay {payout}")))
        }
        _ if payout < 0 => Err(LedgerError::Invalid(format!("negative payout {payout}"))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
