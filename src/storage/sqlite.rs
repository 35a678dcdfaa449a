//! SQLite-backed ledger.
//!
//! Multi-row operations run inside one SQL transaction whose first
//! statement is a write, so SQLite takes the write lock up front and
//! concurrent writers queue on `busy_timeout` instead of failing mid-way.
//! Balance checks live in the `UPDATE ... WHERE balance + ? >= 0` itself,
//! which makes each debit a single atomic decrement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{check_settlement, Ledger, LedgerError, SettleEffect};
use crate::types::{
    Bet, BetId, BetSelection, BetStatus, NewBet, OutcomeValue, Round, Transaction,
    TransactionKind, User, UserId, UserStatus,
};

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const USER_COLUMNS: &str =
    "id, username, balance, initial_balance, status, status_reason, created_at";
const BET_COLUMNS: &str = "id, user_id, period, kind, value, amount, status, payout, created_at";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    balance: i64,
    initial_balance: i64,
    status: String,
    status_reason: Option<String>,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RoundRow {
    id: i64,
    period: String,
    outcome: i64,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BetRow {
    id: i64,
    user_id: i64,
    period: String,
    kind: String,
    value: String,
    amount: i64,
    status: String,
    payout: i64,
    created_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    user_id: i64,
    kind: String,
    amount: i64,
    created_at: i64,
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl TryFrom<UserRow> for User {
    type Error = LedgerError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let status = UserStatus::from_parts(&row.status, row.status_reason)
            .ok_or_else(|| LedgerError::Corrupt(format!("user {} status {}", row.id, row.status)))?;
        Ok(User {
            id: row.id,
            username: row.username,
            balance: row.balance,
            initial_balance: row.initial_balance,
            status,
            created_at: timestamp(row.created_at),
        })
    }
}

impl TryFrom<RoundRow> for Round {
    type Error = LedgerError;

    fn try_from(row: RoundRow) -> Result<Self, Self::Error> {
        let outcome = u8::try_from(row.outcome)
            .ok()
            .and_then(OutcomeValue::new)
            .ok_or_else(|| LedgerError::Corrupt(format!("round {} outcome {}", row.period, row.outcome)))?;
        Ok(Round {
            id: row.id,
            period: row.period,
            outcome,
            created_at: timestamp(row.created_at),
        })
    }
}

impl TryFrom<BetRow> for Bet {
    type Error = LedgerError;

    fn try_from(row: BetRow) -> Result<Self, Self::Error> {
        let selection = BetSelection::parse(&row.kind, &row.value).ok_or_else(|| {
            LedgerError::Corrupt(format!("bet {} selection {}:{}", row.id, row.kind, row.value))
        })?;
        let status = row
            .status
            .parse::<BetStatus>()
            .map_err(|e| LedgerError::Corrupt(format!("bet {}: {e}", row.id)))?;
        Ok(Bet {
            id: row.id,
            user_id: row.user_id,
            period: row.period,
            selection,
            amount: row.amount,
            status,
            payout: row.payout,
            created_at: timestamp(row.created_at),
        })
    }
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<TransactionKind>()
            .map_err(|e| LedgerError::Corrupt(format!("transaction {}: {e}", row.id)))?;
        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            kind,
            amount: row.amount,
            created_at: timestamp(row.created_at),
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, LedgerError>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Balance change plus its transaction row, on an open connection.
async fn apply_delta(
    conn: &mut SqliteConnection,
    user_id: UserId,
    delta: i64,
    kind: TransactionKind,
) -> Result<i64, LedgerError> {
    let updated: Option<i64> = sqlx::query_scalar(
        "UPDATE users SET balance = balance + ?1 WHERE id = ?2 AND balance + ?1 >= 0 RETURNING balance",
    )
    .bind(delta)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(balance) = updated else {
        let current: Option<i64> = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(match current {
            None => LedgerError::UserNotFound(user_id),
            Some(available) => LedgerError::InsufficientBalance {
                needed: -delta,
                available,
            },
        });
    };

    sqlx::query("INSERT INTO transactions (user_id, kind, amount, created_at) VALUES (?1, ?2, ?3, ?4)")
        .bind(user_id)
        .bind(kind.as_str())
        .bind(delta)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;

    Ok(balance)
}

// ---------------------------------------------------------------------------
// SqliteLedger
// ---------------------------------------------------------------------------

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("SQLite ledger ready");
        Ok(Self { pool })
    }

    async fn fetch_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(User::try_from).transpose()
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        self.fetch_user(id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, LedgerError> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        row.map(User::try_from).transpose()
    }

    async fn create_user(&self, username: &str, initial_balance: i64) -> Result<User, LedgerError> {
        if initial_balance < 0 {
            return Err(LedgerError::Invalid("initial balance cannot be negative".into()));
        }
        let row: UserRow = sqlx::query_as(&format!(
            "INSERT INTO users (username, balance, initial_balance, status, created_at) \
             VALUES (?1, ?2, ?2, 'active', ?3) RETURNING {USER_COLUMNS}"
        ))
        .bind(username)
        .bind(initial_balance)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::DuplicateUsername(username.to_string())
            } else {
                LedgerError::Database(e)
            }
        })?;
        User::try_from(row)
    }

    async fn set_user_status(&self, id: UserId, status: UserStatus) -> Result<User, LedgerError> {
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "UPDATE users SET status = ?1, status_reason = ?2 WHERE id = ?3 RETURNING {USER_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(status.reason())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from)
            .transpose()?
            .ok_or(LedgerError::UserNotFound(id))
    }

    async fn get_all_users(&self) -> Result<Vec<User>, LedgerError> {
        let rows: Vec<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        convert_all(rows)
    }

    async fn adjust_balance(
        &self,
        id: UserId,
        delta: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let balance = apply_delta(&mut tx, id, delta, kind).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn update_balance(
        &self,
        id: UserId,
        new_balance: i64,
        kind: TransactionKind,
    ) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        // No-op write first so the read below happens under the write lock.
        let touched = sqlx::query("UPDATE users SET balance = balance WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(LedgerError::UserNotFound(id));
        }
        let current: i64 = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if current == new_balance {
            return Ok(current);
        }
        let balance = apply_delta(&mut tx, id, new_balance - current, kind).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn create_round(&self, period: &str, outcome: OutcomeValue) -> Result<Round, LedgerError> {
        let row: RoundRow = sqlx::query_as(
            "INSERT INTO rounds (period, outcome, created_at) VALUES (?1, ?2, ?3) \
             RETURNING id, period, outcome, created_at",
        )
        .bind(period)
        .bind(i64::from(outcome.get()))
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::DuplicatePeriod(period.to_string())
            } else {
                LedgerError::Database(e)
            }
        })?;
        Round::try_from(row)
    }

    async fn get_recent_rounds(&self, limit: usize) -> Result<Vec<Round>, LedgerError> {
        let rows: Vec<RoundRow> = sqlx::query_as(
            "SELECT id, period, outcome, created_at FROM rounds ORDER BY id DESC LIMIT ?1",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_round_by_period(&self, period: &str) -> Result<Option<Round>, LedgerError> {
        let row: Option<RoundRow> = sqlx::query_as(
            "SELECT id, period, outcome, created_at FROM rounds WHERE period = ?1",
        )
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Round::try_from).transpose()
    }

    async fn get_outcome_frequency(&self) -> Result<BTreeMap<u8, u64>, LedgerError> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT outcome, COUNT(*) FROM rounds GROUP BY outcome")
                .fetch_all(&self.pool)
                .await?;
        let mut freq: BTreeMap<u8, u64> = OutcomeValue::all().map(|o| (o.get(), 0)).collect();
        for (outcome, count) in rows {
            let key = u8::try_from(outcome)
                .map_err(|_| LedgerError::Corrupt(format!("outcome {outcome}")))?;
            freq.insert(key, u64::try_from(count).unwrap_or_default());
        }
        Ok(freq)
    }

    async fn create_bet(&self, bet: NewBet) -> Result<(Bet, i64), LedgerError> {
        if bet.amount <= 0 {
            return Err(LedgerError::Invalid(format!("bet amount {} not positive", bet.amount)));
        }
        let mut tx = self.pool.begin().await?;
        let balance = apply_delta(&mut tx, bet.user_id, -bet.amount, TransactionKind::Bet).await?;
        let row: BetRow = sqlx::query_as(&format!(
            "INSERT INTO bets (user_id, period, kind, value, amount, status, payout, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6) RETURNING {BET_COLUMNS}"
        ))
        .bind(bet.user_id)
        .bind(&bet.period)
        .bind(bet.selection.kind().as_str())
        .bind(bet.selection.value())
        .bind(bet.amount)
        .bind(now_ms())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((Bet::try_from(row)?, balance))
    }

    async fn get_bets_by_period(&self, period: &str) -> Result<Vec<Bet>, LedgerError> {
        let rows: Vec<BetRow> = sqlx::query_as(&format!(
            "SELECT {BET_COLUMNS} FROM bets WHERE period = ?1 ORDER BY id"
        ))
        .bind(period)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_pending_bets(&self, period: &str) -> Result<Vec<Bet>, LedgerError> {
        let rows: Vec<BetRow> = sqlx::query_as(&format!(
            "SELECT {BET_COLUMNS} FROM bets WHERE period = ?1 AND status = 'pending' ORDER BY id"
        ))
        .bind(period)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_pending_periods(&self) -> Result<Vec<String>, LedgerError> {
        let periods: Vec<String> = sqlx::query_scalar(
            "SELECT period FROM bets WHERE status = 'pending' GROUP BY period ORDER BY MIN(id)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(periods)
    }

    async fn update_bet_outcome(
        &self,
        bet_id: BetId,
        status: BetStatus,
        payout: i64,
    ) -> Result<SettleEffect, LedgerError> {
        check_settlement(status, payout)?;
        let mut tx = self.pool.begin().await?;
        let marked: Option<i64> = sqlx::query_scalar(
            "UPDATE bets SET status = ?1, payout = ?2 WHERE id = ?3 AND status = 'pending' RETURNING user_id",
        )
        .bind(status.as_str())
        .bind(payout)
        .bind(bet_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user_id) = marked else {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM bets WHERE id = ?1")
                .bind(bet_id)
                .fetch_optional(&mut *tx)
                .await?;
            return match exists {
                Some(_) => Ok(SettleEffect::AlreadySettled),
                None => Err(LedgerError::BetNotFound(bet_id)),
            };
        };

        let credited_balance = if status == BetStatus::Won && payout > 0 {
            Some(apply_delta(&mut tx, user_id, payout, TransactionKind::Win).await?)
        } else {
            None
        };
        tx.commit().await?;
        Ok(SettleEffect::Settled { credited_balance })
    }

    async fn get_user_bets(&self, user_id: UserId, limit: usize) -> Result<Vec<Bet>, LedgerError> {
        let rows: Vec<BetRow> = sqlx::query_as(&format!(
            "SELECT {BET_COLUMNS} FROM bets WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))
        .bind(user_id)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_user_transactions(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            "SELECT id, user_id, kind, amount, created_at FROM transactions \
             WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
