//! In-memory ledger.
//!
//! One mutex guards all tables, so each trait method is a single atomic
//! unit. Nothing is awaited while the lock is held.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{check_settlement, Ledger, LedgerError, SettleEffect};
use crate::types::{
    Bet, BetId, BetStatus, NewBet, OutcomeValue, Round, Transaction, TransactionKind, User,
    UserId, UserStatus,
};

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    rounds: Vec<Round>,
    bets: BTreeMap<BetId, Bet>,
    transactions: Vec<Transaction>,
    next_user_id: i64,
    next_round_id: i64,
    next_bet_id: i64,
    next_tx_id: i64,
}

impl Tables {
    fn user_mut(&mut self, id: UserId) -> Result<&mut User, LedgerError> {
        self.users.get_mut(&id).ok_or(LedgerError::UserNotFound(id))
    }

    /// Balance change plus its transaction row.
    fn apply_delta(
        &mut self,
        id: UserId,
        delta: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        let user = self.user_mut(id)?;
        let new_balance = user
            .balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::Invalid(format!("balance overflow for user {id}")))?;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientBalance {
                needed: -delta,
                available: user.balance,
            });
        }
        user.balance = new_balance;

        self.next_tx_id += 1;
        self.transactions.push(Transaction {
            id: self.next_tx_id,
            user_id: id,
            kind,
            amount: delta,
            created_at: Utc::now(),
        });
        Ok(new_balance)
    }
}

pub struct MemoryLedger {
    tables: Mutex<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, LedgerError> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn create_user(&self, username: &str, initial_balance: i64) -> Result<User, LedgerError> {
        if initial_balance < 0 {
            return Err(LedgerError::Invalid("initial balance cannot be negative".into()));
        }
        let mut tables = self.lock();
        if tables.users.values().any(|u| u.username == username) {
            return Err(LedgerError::DuplicateUsername(username.to_string()));
        }
        tables.next_user_id += 1;
        let user = User {
            id: tables.next_user_id,
            username: username.to_string(),
            balance: initial_balance,
            initial_balance,
            status: UserStatus::Active,
            created_at: Utc::now(),
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_user_status(&self, id: UserId, status: UserStatus) -> Result<User, LedgerError> {
        let mut tables = self.lock();
        let user = tables.user_mut(id)?;
        user.status = status;
        Ok(user.clone())
    }

    async fn get_all_users(&self) -> Result<Vec<User>, LedgerError> {
        Ok(self.lock().users.values().cloned().collect())
    }

    async fn adjust_balance(
        &self,
        id: UserId,
        delta: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        self.lock().apply_delta(id, delta, kind)
    }

    async fn update_balance(
        &self,
        id: UserId,
        new_balance: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        let mut tables = self.lock();
        let current = tables.user_mut(id)?.balance;
        if new_balance == current {
            return Ok(current);
        }
        tables.apply_delta(id, new_balance - current, kind)
    }

    async fn create_round(&self, period: &str, outcome: OutcomeValue) -> Result<Round, LedgerError> {
        let mut tables = self.lock();
        if tables.rounds.iter().any(|r| r.period == period) {
            return Err(LedgerError::DuplicatePeriod(period.to_string()));
        }
        tables.next_round_id += 1;
        let round = Round {
            id: tables.next_round_id,
            period: period.to_string(),
            outcome,
            created_at: Utc::now(),
        };
        tables.rounds.push(round.clone());
        Ok(round)
    }

    async fn get_recent_rounds(&self, limit: usize) -> Result<Vec<Round>, LedgerError> {
        Ok(self.lock().rounds.iter().rev().take(limit).cloned().collect())
    }

    async fn get_round_by_period(&self, period: &str) -> Result<Option<Round>, LedgerError> {
        Ok(self.lock().rounds.iter().find(|r| r.period == period).cloned())
    }

    async fn get_outcome_frequency(&self) -> Result<BTreeMap<u8, u64>, LedgerError> {
        let mut freq: BTreeMap<u8, u64> = OutcomeValue::all().map(|o| (o.get(), 0)).collect();
        for round in &self.lock().rounds {
            *freq.entry(round.outcome.get()).or_default() += 1;
        }
        Ok(freq)
    }

    async fn create_bet(&self, bet: NewBet) -> Result<(Bet, i64), LedgerError> {
        if bet.amount <= 0 {
            return Err(LedgerError::Invalid(format!("bet amount {} not positive", bet.amount)));
        }
        let mut tables = self.lock();
        let new_balance = tables.apply_delta(bet.user_id, -bet.amount, TransactionKind::Bet)?;
        tables.next_bet_id += 1;
        let stored = Bet {
            id: tables.next_bet_id,
            user_id: bet.user_id,
            period: bet.period,
            selection: bet.selection,
            amount: bet.amount,
            status: BetStatus::Pending,
            payout: 0,
            created_at: Utc::now(),
        };
        tables.bets.insert(stored.id, stored.clone());
        Ok((stored, new_balance))
    }

    async fn get_bets_by_period(&self, period: &str) -> Result<Vec<Bet>, LedgerError> {
        Ok(self
            .lock()
            .bets
            .values()
            .filter(|b| b.period == period)
            .cloned()
            .collect())
    }

    async fn get_pending_bets(&self, period: &str) -> Result<Vec<Bet>, LedgerError> {
        Ok(self
            .lock()
            .bets
            .values()
            .filter(|b| b.period == period && b.status == BetStatus::Pending)
            .cloned()
            .collect())
    }

    async fn get_pending_periods(&self) -> Result<Vec<String>, LedgerError> {
        let tables = self.lock();
        let mut periods: Vec<String> = Vec::new();
        for bet in tables.bets.values().filter(|b| b.status == BetStatus::Pending) {
            if !periods.contains(&bet.period) {
                periods.push(bet.period.clone());
            }
        }
        Ok(periods)
    }

    async fn update_bet_outcome(
        &self,
        bet_id: BetId,
        status: BetStatus,
        payout: i64,
    ) -> Result<SettleEffect, LedgerError> {
        check_settlement(status, payout)?;
        let mut tables = self.lock();
        let bet = tables.bets.get(&bet_id).ok_or(LedgerError::BetNotFound(bet_id))?;
        if bet.status.is_terminal() {
            return Ok(SettleEffect::AlreadySettled);
        }
        let user_id = bet.user_id;

        // Credit first: if it fails the bet stays pending.
        let credited_balance = if status == BetStatus::Won && payout > 0 {
            Some(tables.apply_delta(user_id, payout, TransactionKind::Win)?)
        } else {
            None
        };

        if let Some(bet) = tables.bets.get_mut(&bet_id) {
            bet.status = status;
            bet.payout = payout;
        }
        Ok(SettleEffect::Settled { credited_balance })
    }

    async fn get_user_bets(&self, user_id: UserId, limit: usize) -> Result<Vec<Bet>, LedgerError> {
        Ok(self
            .lock()
            .bets
            .values()
            .rev()
            .filter(|b| b.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_user_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
