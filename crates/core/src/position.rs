//! Log positions
//!
//! Positions are strictly increasing 64-bit values assigned by the log stream.
//! Inside the workspace an absent position is `Option::None`; on the wire it
//! is the signed sentinel [`NO_POSITION`].

/// A log position.
pub type Position = u64;

/// Wire value for "no position" (no snapshot, nothing committed).
pub const NO_POSITION: i64 = -1;

/// Highest position with a signed wire representation.
pub const MAX_POSITION: Position = i64::MAX as Position;

/// True if `position` fits the signed wire representation.
pub fn is_valid_position(position: Position) -> bool {
    position <= MAX_POSITION
}

/// Convert an optional position to its signed wire representation.
///
/// Positions above [`MAX_POSITION`] are rejected where they enter the
/// system; here they saturate so they can never read as [`NO_POSITION`].
pub fn position_to_wire(position: Option<Position>) -> i64 {
    match position {
        Some(p) => i64::try_from(p).unwrap_or(i64::MAX),
        None => NO_POSITION,
    }
}

/// Convert a signed wire position back; any negative value means "none".
pub fn position_from_wire(value: i64) -> Option<Position> {
    if value < 0 {
        None
    } else {
        Some(value as u64)
    }
}
