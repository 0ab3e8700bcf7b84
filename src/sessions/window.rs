//! History window: keep the most recent turns, evict from the front.

use super::traits::Turn;

/// Drop the oldest turns until at most `window` remain.
pub fn truncate_to_window(turns: &mut Vec<Turn>, window: usize) {
    let excess = turns.len().saturating_sub(window);
    if excess > 0 {
        turns.drain(..excess);
    }
}

/// Append `turn` and re-apply the window.
pub fn push_windowed(turns: &mut Vec<Turn>, turn: Turn, window: usize) {
    turns.push(turn);
    truncate_to_window(turns, window);
}
