//! Shared types for the color game.
//!
//! These types form the data model used across all modules. Bet kinds
//! and values are a closed tagged variant (`BetSelection`), so an illegal
//! kind/value combination cannot exist once a request has been parsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type UserId = i64;
pub type BetId = i64;

// ---------------------------------------------------------------------------
// Outcome space
// ---------------------------------------------------------------------------

/// Number of distinct outcome values. Draws are uniform over `0..OUTCOME_SPACE`.
pub const OUTCOME_SPACE: u8 = 10;

/// A drawn round result. Always within `0..OUTCOME_SPACE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct OutcomeValue(pub(crate) u8);

impl OutcomeValue {
    pub fn new(value: u8) -> Option<Self> {
        (value < OUTCOME_SPACE).then_some(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Every value in the outcome space, ascending.
    pub fn all() -> impl Iterator<Item = OutcomeValue> {
        (0..OUTCOME_SPACE).map(OutcomeValue)
    }
}

impl TryFrom<u8> for OutcomeValue {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        OutcomeValue::new(value).ok_or_else(|| format!("outcome {value} outside 0..{OUTCOME_SPACE}"))
    }
}

impl From<OutcomeValue> for u8 {
    fn from(value: OutcomeValue) -> Self {
        value.0
    }
}

impl fmt::Display for OutcomeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Color class of an outcome value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Green,
    Violet,
    Red,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Green => "green",
            Color::Violet => "violet",
            Color::Red => "red",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = String;

    /// Colors are matched exactly (lowercase), as they are stored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(Color::Green),
            "violet" => Ok(Color::Violet),
            "red" => Ok(Color::Red),
            other => Err(format!("unknown color: {other}")),
        }
    }
}

/// Size class of an outcome value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    Big,
    Small,
}

impl Size {
    pub fn as_str(&self) -> &'static str {
        match self {
            Size::Big => "big",
            Size::Small => "small",
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "big" => Ok(Size::Big),
            "small" => Ok(Size::Small),
            other => Err(format!("unknown size: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

/// The three bet families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetKind {
    Color,
    Number,
    Size,
}

impl BetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetKind::Color => "color",
            BetKind::Number => "number",
            BetKind::Size => "size",
        }
    }
}

impl fmt::Display for BetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BetKind {
    type Err = String;

    /// Accepts `bigSmall` as an alias for `size` (older client wire name).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "color" => Ok(BetKind::Color),
            "number" => Ok(BetKind::Number),
            "size" | "bigSmall" | "bigsmall" => Ok(BetKind::Size),
            other => Err(format!("unknown bet kind: {other}")),
        }
    }
}

/// What a bet is placed on. Only legal kind/value pairs are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum BetSelection {
    Color(Color),
    Number(OutcomeValue),
    Size(Size),
}

impl BetSelection {
    /// Parse an untrusted `(kind, value)` pair. Returns `None` for any
    /// unknown kind or a value that is invalid for its kind.
    pub fn parse(kind: &str, value: &str) -> Option<Self> {
        match kind.parse::<BetKind>().ok()? {
            BetKind::Color => value.parse::<Color>().ok().map(BetSelection::Color),
            BetKind::Number => value
                .parse::<u8>()
                .ok()
                .and_then(OutcomeValue::new)
                .map(BetSelection::Number),
            BetKind::Size => value.parse::<Size>().ok().map(BetSelection::Size),
        }
    }

    pub fn kind(&self) -> BetKind {
        match self {
            BetSelection::Color(_) => BetKind::Color,
            BetSelection::Number(_) => BetKind::Number,
            BetSelection::Size(_) => BetKind::Size,
        }
    }

    /// Canonical value string, as persisted.
    pub fn value(&self) -> String {
        match self {
            BetSelection::Color(c) => c.as_str().to_string(),
            BetSelection::Number(n) => n.to_string(),
            BetSelection::Size(s) => s.as_str().to_string(),
        }
    }
}

impl fmt::Display for BetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Settlement state of a bet. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BetStatus::Pending)
    }
}

impl FromStr for BetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BetStatus::Pending),
            "won" => Ok(BetStatus::Won),
            "lost" => Ok(BetStatus::Lost),
            other => Err(format!("unknown bet status: {other}")),
        }
    }
}

/// One wager, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub id: BetId,
    pub user_id: UserId,
    pub period: String,
    pub selection: BetSelection,
    pub amount: i64,
    pub status: BetStatus,
    /// Amount credited when won; 0 otherwise.
    pub payout: i64,
    pub created_at: DateTime<Utc>,
}

impl Bet {
    pub fn is_win(&self) -> Option<bool> {
        match self.status {
            BetStatus::Pending => None,
            BetStatus::Won => Some(true),
            BetStatus::Lost => Some(false),
        }
    }
}

/// A bet about to be admitted. The ledger debits `amount` in the same unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBet {
    pub user_id: UserId,
    pub period: String,
    pub selection: BetSelection,
    pub amount: i64,
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

/// A settled betting cycle. Color and size are derived from `outcome`
/// on demand and never stored separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub id: i64,
    pub period: String,
    pub outcome: OutcomeValue,
    pub created_at: DateTime<Utc>,
}

impl Round {
    pub fn color(&self) -> Color {
        self.outcome.color()
    }

    pub fn size(&self) -> Size {
        self.outcome.size()
    }
}

/// Wire view of a round result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResult {
    pub period: String,
    pub outcome_value: OutcomeValue,
    pub color_class: Color,
    pub size_class: Size,
    pub created_at: DateTime<Utc>,
}

impl From<&Round> for RoundResult {
    fn from(round: &Round) -> Self {
        RoundResult {
            period: round.period.clone(),
            outcome_value: round.outcome,
            color_class: round.color(),
            size_class: round.size(),
            created_at: round.created_at,
        }
    }
}

/// Point-in-time view of the round engine, for broadcast and initial sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub period: String,
    pub seconds_remaining: u32,
    pub betting_open: bool,
    pub recent_rounds: Vec<RoundResult>,
}

// ---------------------------------------------------------------------------
// Users and the transaction log
// ---------------------------------------------------------------------------

/// Account standing. Only `Active` users may place bets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended { reason: String },
    Banned { reason: String },
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Suspended { .. } => "suspended",
            UserStatus::Banned { .. } => "banned",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            UserStatus::Active => None,
            UserStatus::Suspended { reason } | UserStatus::Banned { reason } => Some(reason),
        }
    }

    /// Rebuild from the stored `(status, reason)` column pair.
    pub fn from_parts(status: &str, reason: Option<String>) -> Option<Self> {
        let reason = reason.unwrap_or_default();
        match status {
            "active" => Some(UserStatus::Active),
            "suspended" => Some(UserStatus::Suspended { reason }),
            "banned" => Some(UserStatus::Banned { reason }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Never negative.
    pub balance: i64,
    /// Balance at creation. `balance - initial_balance` equals the sum of
    /// the user's transaction amounts.
    pub initial_balance: i64,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Bet,
    Win,
    AdminCredit,
    AdminDebit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
            TransactionKind::Bet => "bet",
            TransactionKind::Win => "win",
            TransactionKind::AdminCredit => "admin_credit",
            TransactionKind::AdminDebit => "admin_debit",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdraw" => Ok(TransactionKind::Withdraw),
            "bet" => Ok(TransactionKind::Bet),
            "win" => Ok(TransactionKind::Win),
            "admin_credit" => Ok(TransactionKind::AdminCredit),
            "admin_debit" => Ok(TransactionKind::AdminDebit),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

/// Immutable ledger entry. `amount` is the signed balance delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client messages
// ---------------------------------------------------------------------------

/// Result of a bet request, pushed to the bettor's connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<RejectionCode>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdate {
    pub new_balance: i64,
}

/// Every message a connected client can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    RoundSnapshot(RoundSnapshot),
    RoundResult(RoundResult),
    BetOutcome(BetResponse),
    BalanceUpdate(BalanceUpdate),
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Stable machine-readable reason for refusing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    InvalidKindValue,
    InvalidAmount,
    RoundClosed,
    UserBanned,
    InsufficientBalance,
    UnknownUser,
    /// Transient storage failure; the caller may retry.
    Unavailable,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::InvalidKindValue => "invalid_kind_value",
            RejectionCode::InvalidAmount => "invalid_amount",
            RejectionCode::RoundClosed => "round_closed",
            RejectionCode::UserBanned => "user_banned",
            RejectionCode::InsufficientBalance => "insufficient_balance",
            RejectionCode::UnknownUser => "unknown_user",
            RejectionCode::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused request: stable code plus a short human-readable message.
/// Never carries internal error detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_kind_value() -> Self {
        Self::new(RejectionCode::InvalidKindValue, "Invalid bet type or value")
    }

    pub fn invalid_amount() -> Self {
        Self::new(RejectionCode::InvalidAmount, "Amount must be a positive integer")
    }

    pub fn round_closed() -> Self {
        Self::new(RejectionCode::RoundClosed, "Round not accepting bets, please wait")
    }

    pub fn user_banned(reason: Option<&str>) -> Self {
        match reason.filter(|r| !r.is_empty()) {
            Some(reason) => Self::new(RejectionCode::UserBanned, format!("Account restricted: {reason}")),
            None => Self::new(RejectionCode::UserBanned, "Account restricted"),
        }
    }

    pub fn insufficient_balance() -> Self {
        Self::new(RejectionCode::InsufficientBalance, "Insufficient balance")
    }

    pub fn unknown_user() -> Self {
        Self::new(RejectionCode::UnknownUser, "User not found")
    }

    pub fn unavailable() -> Self {
        Self::new(RejectionCode::Unavailable, "Service temporarily unavailable, please retry")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
