//! Fault-injecting ledger for integration testing.
//!
//! Wraps a `MemoryLedger` and fails chosen operations on demand, so tests
//! can exercise the engine's retry and reconciliation paths. Injected
//! failures look like timeouts, which callers treat as transient. Bet
//! writes can also be slowed so they commit after the caller gave up.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colorgame::storage::{Ledger, LedgerError, MemoryLedger, SettleEffect};
use colorgame::types::*;

pub struct FlakyLedger {
    inner: Arc<MemoryLedger>,
    /// Remaining `create_round` calls that will fail.
    round_failures: AtomicU32,
    /// Remaining `update_bet_outcome` calls that will fail.
    settle_failures: AtomicU32,
    /// If set, every call fails.
    outage: AtomicBool,
    /// Delay before a bet write commits, in milliseconds. The write runs in
    /// its own task and completes even if the caller stops waiting.
    bet_commit_delay_ms: AtomicU64,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryLedger::new()),
            round_failures: AtomicU32::new(0),
            settle_failures: AtomicU32::new(0),
            outage: AtomicBool::new(false),
            bet_commit_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn fail_next_rounds(&self, n: u32) {
        self.round_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_settlements(&self, n: u32) {
        self.settle_failures.store(n, Ordering::SeqCst);
    }

    pub fn delay_bet_commits(&self, delay: Duration) {
        self.bet_commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected() -> LedgerError {
    LedgerError::Timeout(Duration::ZERO)
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        self.check()?;
        self.inner.get_user(id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, LedgerError> {
        self.check()?;
        self.inner.get_user_by_username(username).await
    }

    async fn create_user(&self, username: &str, initial_balance: i64) -> Result<User, LedgerError> {
        self.check()?;
        self.inner.create_user(username, initial_balance).await
    }

    async fn set_user_status(&self, id: UserId, status: UserStatus) -> Result<User, LedgerError> {
        self.check()?;
        self.inner.set_user_status(id, status).await
    }

    async fn get_all_users(&self) -> Result<Vec<User>, LedgerError> {
        self.check()?;
        self.inner.get_all_users().await
    }

    async fn adjust_balance(
        &self,
        id: UserId,
        delta: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        self.check()?;
        self.inner.adjust_balance(id, delta, kind).await
    }

    async fn update_balance(
        &self,
        id: UserId,
        new_balance: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        self.check()?;
        self.inner.update_balance(id, new_balance, kind).await
    }

    async fn create_round(&self, period: &str, outcome: OutcomeValue) -> Result<Round, LedgerError> {
        self.check()?;
        if Self::take(&self.round_failures) {
            return Err(injected());
        }
        self.inner.create_round(period, outcome).await
    }

    async fn get_recent_rounds(&self, limit: usize) -> Result<Vec<Round>, LedgerError> {
        self.check()?;
        self.inner.get_recent_rounds(limit).await
    }

    async fn get_round_by_period(&self, period: &str) -> Result<Option<Round>, LedgerError> {
        self.check()?;
        self.inner.get_round_by_period(period).await
    }

    async fn get_outcome_frequency(&self) -> Result<BTreeMap<u8, u64>, LedgerError> {
        self.check()?;
        self.inner.get_outcome_frequency().await
    }

    async fn create_bet(&self, bet: NewBet) -> Result<(Bet, i64), LedgerError> {
        self.check()?;
        let delay = self.bet_commit_delay_ms.load(Ordering::SeqCst);
        if delay == 0 {
            return self.inner.create_bet(bet).await;
        }
        let inner = self.inner.clone();
        let commit = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            inner.create_bet(bet).await
        });
        commit.await.map_err(|_| injected())?
    }

    async fn get_bets_by_period(&self, period: &str) -> Result<Vec<Bet>, LedgerError> {
        self.check()?;
        self.inner.get_bets_by_period(period).await
    }

    async fn get_pending_bets(&self, period: &str) -> Result<Vec<Bet>, LedgerError> {
        self.check()?;
        self.inner.get_pending_bets(period).await
    }

    async fn get_pending_periods(&self) -> Result<Vec<String>, LedgerError> {
        self.check()?;
        self.inner.get_pending_periods().await
    }

    async fn update_bet_outcome(
        &self,
        bet_id: BetId,
        status: BetStatus,
        payout: i64,
    ) -> Result<SettleEffect, LedgerError> {
        self.check()?;
        if Self::take(&self.settle_failures) {
            return Err(injected());
        }
        self.inner.update_bet_outcome(bet_id, status, payout).await
    }

    async fn get_user_bets(&self, user_id: UserId, limit: usize) -> Result<Vec<Bet>, LedgerError> {
        self.check()?;
        self.inner.get_user_bets(user_id, limit).await
    }

    async fn get_user_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.check()?;
        self.inner.get_user_transactions(user_id, limit).await
    }
}
