//! Deterministic story selection.

use std::collections::HashSet;

use crate::core::types::{Ledger, Story};

/// First not-done story in priority order, skipping ids given up on this run.
///
/// Returns `None` when nothing buildable remains.
pub fn next_story<'a>(ledger: &'a Ledger, skipped: &HashSet<String>) -> Option<&'a Story> {
    ledger
        .open_stories()
        .find(|story| !skipped.contains(&story.id))
}
