//! Outcome table: color/size derivation and payout multipliers.
//!
//! Pure functions over the fixed outcome space. Callers validate bet
//! kinds and values (via `BetSelection::parse`) before anything here runs.

use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;

use crate::types::{BetSelection, Color, OutcomeValue, Size, OUTCOME_SPACE};

/// Color assignment per outcome value. Violet holds exactly two slots (0 and 5).
const COLOR_TABLE: [Color; OUTCOME_SPACE as usize] = [
    Color::Violet,
    Color::Green,
    Color::Red,
    Color::Green,
    Color::Red,
    Color::Violet,
    Color::Red,
    Color::Green,
    Color::Red,
    Color::Green,
];

/// Values at or above this are `Big`.
pub const BIG_THRESHOLD: u8 = OUTCOME_SPACE / 2;

/// Source of round outcomes. Production draws uniformly; tests script it.
pub type OutcomeSource = Box<dyn FnMut() -> OutcomeValue + Send>;

pub fn derive_color(outcome: OutcomeValue) -> Color {
    COLOR_TABLE[outcome.get() as usize]
}

pub fn derive_size(outcome: OutcomeValue) -> Size {
    if outcome.get() >= BIG_THRESHOLD {
        Size::Big
    } else {
        Size::Small
    }
}

impl OutcomeValue {
    pub fn color(self) -> Color {
        derive_color(self)
    }

    pub fn size(self) -> Size {
        derive_size(self)
    }
}

/// Payout multiplier for a winning selection.
pub fn multiplier_for(selection: &BetSelection) -> Decimal {
    match selection {
        BetSelection::Color(Color::Violet) => dec!(4.5),
        BetSelection::Color(Color::Green | Color::Red) => dec!(2),
        BetSelection::Number(_) => dec!(9),
        BetSelection::Size(_) => dec!(2),
    }
}

/// Whether `selection` wins against a round that drew `outcome`.
pub fn is_winning(selection: &BetSelection, outcome: OutcomeValue) -> bool {
    match selection {
        BetSelection::Color(color) => *color == derive_color(outcome),
        BetSelection::Number(n) => *n == outcome,
        BetSelection::Size(size) => *size == derive_size(outcome),
    }
}

/// Amount credited for a bet of `amount` on `selection`. Zero on a loss.
/// Fractional payouts (violet on an odd stake) round down to whole units.
pub fn payout_for(selection: &BetSelection, amount: i64, outcome: OutcomeValue) -> i64 {
    if !is_winning(selection, outcome) {
        return 0;
    }
    (Decimal::from(amount) * multiplier_for(selection))
        .floor()
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Draw one outcome uniformly from the outcome space.
pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> OutcomeValue {
    OutcomeValue(rng.gen_range(0..OUTCOME_SPACE))
}

/// An `OutcomeSource` backed by `rng`.
pub fn uniform_source<R: Rng + Send + 'static>(mut rng: R) -> OutcomeSource {
    Box::new(move || draw(&mut rng))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
