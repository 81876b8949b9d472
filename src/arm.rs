//! Arm position model and the coordinate arithmetic used by motion tasks.
//!
//! Positions are centimeters and are always stored rounded to two decimal
//! digits. Rounding is round-half-down evaluated on the *exact* binary value
//! of the `f64`, so a delta such as `1.005` (stored as `1.00499999...`)
//! rounds to `1.00` while an exactly representable tie such as `0.125`
//! rounds toward zero to `0.12`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fractional digits kept for positions and deltas.
pub const POSITION_DECIMALS: u32 = 2;

/// A point on the deck, in centimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    /// X position (cm)
    pub x: f64,
    /// Y position (cm)
    pub y: f64,
}

impl Coordinate {
    /// Creates a coordinate without rounding.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

/// Rounds `value` to two decimal digits, ties toward zero.
///
/// The decision is made on the exact rational value of the `f64` rather than
/// on `value * 100.0`, which would itself round. The result is the `f64`
/// nearest to the chosen decimal. Negative zero is normalized to `0.0`;
/// non-finite input is returned unchanged.
pub fn round_half_down(value: f64) -> f64 {
    if !value.is_finite() || value == 0.0 {
        return if value == 0.0 { 0.0 } else { value };
    }

    let bits = value.to_bits();
    let negative = bits >> 63 == 1;
    let exponent_bits = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1u64 << 52) - 1);

    // value = mantissa * 2^exponent exactly
    let (mantissa, exponent) = if exponent_bits == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1u64 << 52), exponent_bits - 1075)
    };

    let scaled = u128::from(mantissa) * 100;
    let hundredths: u128 = if exponent >= 0 {
        // Already an integer number of hundredths; anything this large is
        // far outside the deck anyway.
        return value;
    } else {
        let shift = exponent.unsigned_abs();
        if shift >= 127 {
            // scaled < 2^60, so the value is below half a hundredth
            0
        } else {
            let quotient = scaled >> shift;
            let remainder = scaled & ((1u128 << shift) - 1);
            let half = 1u128 << (shift - 1);
            if remainder > half {
                quotient + 1
            } else {
                quotient
            }
        }
    };

    if hundredths == 0 {
        return 0.0;
    }
    let magnitude = hundredths as f64 / 100.0;
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// The arm's logical position.
///
/// Only the execution loop owns an `ArmState`; everyone else sees
/// [`Coordinate`] copies published after each committed move.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmState {
    position: Coordinate,
}

impl ArmState {
    /// Creates an arm state at `home`, rounded to two decimals.
    pub fn new(home: Coordinate) -> Self {
        Self {
            position: Coordinate::new(round_half_down(home.x), round_half_down(home.y)),
        }
    }

    /// Current X position (cm).
    pub fn x(&self) -> f64 {
        self.position.x
    }

    /// Current Y position (cm).
    pub fn y(&self) -> f64 {
        self.position.y
    }

    /// Copy of the current position.
    pub fn position(&self) -> Coordinate {
        self.position
    }

    /// Rounded relative move from the current position to `destination`.
    ///
    /// The sign convention is current minus destination; the controller
    /// interprets it that way.
    pub fn delta_to(&self, destination: Coordinate) -> Coordinate {
        Coordinate::new(
            round_half_down(self.position.x - destination.x),
            round_half_down(self.position.y - destination.y),
        )
    }

    /// Commits a move that was sent to the hardware as `delta`.
    ///
    /// The new position is `current - delta`, rounded again. Because `delta`
    /// was already rounded, repeated moves can drift from the nominal well
    /// centers; that drift is what the controller actually travels.
    pub fn apply_delta(&mut self, delta: Coordinate) {
        self.position = Coordinate::new(
            round_half_down(self.position.x - delta.x),
            round_half_down(self.position.y - delta.y),
        );
    }
}

impl Default for ArmState {
    fn default() -> Self {
        Self::new(Coordinate::default())
    }
}
