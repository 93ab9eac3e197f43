//! Category Store: versioned persistence of hierarchical classification
//! rows keyed by `(taskId, code)` with a current-version pointer.

mod schema;
mod sqlite_store;
mod types;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sqlite_store::{CategoryStore, SqliteCategoryStore};
pub use types::{
    parent_code_of, CategoryRow, CodePatch, DataSource, Level, RowFilter, RowPatch, RowStatus,
    VersionHistoryEntry,
};

/// Resolves the spec's open question on "latest complete version": the
/// newest batch in `history` (timestamp descending, as returned by
/// `VersionHistory`) qualifies as complete when its row count is at least
/// `factor` times the largest row count among older batches — a batch with
/// no predecessor always qualifies. If the newest batch looks like a
/// partial re-write (falls below that bar), fall back to whichever batch
/// has `is_current = true`.
pub fn latest_complete_version(
    history: &[VersionHistoryEntry],
    factor: f64,
) -> Option<&VersionHistoryEntry> {
    let newest = history.first()?;
    let max_previous = history[1..].iter().map(|e| e.row_count).max().unwrap_or(0);

    let qualifies = max_previous == 0 || newest.row_count as f64 >= max_previous as f64 * factor;
    if qualifies {
        Some(newest)
    } else {
        history.iter().find(|e| e.is_current)
    }
}
