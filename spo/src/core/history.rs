//! Compact history text fed back to the optimizer.

use crate::core::types::HistoryRecord;

/// How many of the most recent records the optimizer sees.
pub const HISTORY_WINDOW: usize = 3;

/// Render the last [`HISTORY_WINDOW`] records, oldest first, one per line.
///
/// Empty when no iteration has completed.
pub fn history_summary(history: &[HistoryRecord]) -> String {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .map(|record| {
            let outcome = if record.accepted {
                "improved"
            } else {
                "not improved"
            };
            format!("iteration {}: {}", record.iteration, outcome)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
