//! Snapshot retention
//!
//! Only valid (position-named) snapshots take part in retention. Temporary
//! `-tmp` directories are never selected; abandoned ones are handled by the
//! controller's explicit orphan sweep.

use partstate_core::Position;

/// Positions to delete so that at most `max_snapshots` of the highest remain.
///
/// Input order does not matter; the result is sorted newest first.
pub fn snapshots_to_prune(positions: &[Position], max_snapshots: usize) -> Vec<Position> {
    let mut sorted = positions.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    sorted.into_iter().skip(max_snapshots).collect()
}
