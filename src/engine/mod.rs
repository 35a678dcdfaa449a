//! Core engine: the round clock, bet admission and settlement.
//!
//! `RoundEngine` owns the only `RoundState`. `BetIntake` admits bets while
//! the round is open, `SettlementProcessor` resolves a closed round, and
//! `Reconciler` picks up anything a failed or interrupted close left
//! pending. `Wallet` handles the balance operations that sit outside rounds.

pub mod intake;
pub mod outcome;
pub mod reconcile;
pub mod round;
pub mod settlement;
pub mod wallet;

pub use intake::{BetIntake, BetReceipt, BetRequest};
pub use reconcile::{ReconcileReport, Reconciler};
pub use round::{EngineSettings, PeriodGenerator, RoundEngine, RoundState};
pub use settlement::{SettlementProcessor, SettlementReport};
pub use wallet::Wallet;

use tracing::{debug, error};

use crate::storage::LedgerError;
use crate::types::Rejection;

/// Translate a ledger failure into what a client may see. Internal detail
/// is logged here and never forwarded.
pub(crate) fn ledger_rejection(err: LedgerError, op: &'static str) -> Rejection {
    match err {
        LedgerError::UserNotFound(user_id) => {
            debug!(op, user_id, "Unknown user");
            Rejection::unknown_user()
        }
        LedgerError::InsufficientBalance { needed, available } => {
            debug!(op, needed, available, "Insufficient balance");
            Rejection::insufficient_balance()
        }
        LedgerError::Invalid(reason) => {
            debug!(op, %reason, "Ledger refused operation");
            Rejection::invalid_amount()
        }
        other => {
            error!(op, error = %other, "Ledger call failed");
            Rejection::unavailable()
        }
    }
}
