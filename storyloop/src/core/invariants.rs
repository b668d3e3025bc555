//! Semantic ledger invariants not expressible via serde alone.

use std::collections::{HashMap, HashSet};

use crate::core::types::{Ledger, Story, StoryStatus};

/// Check ledger invariants:
/// - No empty or duplicate ids
/// - `completedAt` only on done stories
pub fn validate_ledger(ledger: &Ledger) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, story) in ledger.stories.iter().enumerate() {
        if story.id.trim().is_empty() {
            errors.push(format!("story at index {index} has an empty id"));
            continue;
        }
        if !seen.insert(story.id.as_str()) {
            errors.push(format!("duplicate id '{}'", story.id));
        }
        if story.completed_at.is_some() && !story.status.is_done() {
            errors.push(format!(
                "{}: completedAt set but status is {}",
                story.id,
                story.status.as_str()
            ));
        }
    }

    errors
}

/// Soft problems worth a log line but not worth refusing the ledger.
pub fn ledger_warnings(ledger: &Ledger) -> Vec<String> {
    ledger
        .stories
        .iter()
        .filter(|story| story.status.is_done() && story.completed_at.is_none())
        .map(|story| format!("{}: done without completedAt", story.id))
        .collect()
}

/// Undo backwards status moves and `whyNow` edits made out-of-band.
///
/// For each story present in both ledgers:
/// - a status with lower rank than before is restored (with its `completedAt`)
/// - a changed `whyNow` is restored
///
/// Stories missing from `next` stay missing. Returns one message per
/// correction, sorted by id.
pub fn enforce_monotonic(prev: &Ledger, next: &mut Ledger) -> Vec<String> {
    let prev_index: HashMap<&str, &Story> = prev
        .stories
        .iter()
        .map(|story| (story.id.as_str(), story))
        .collect();

    let mut messages = Vec::new();
    for story in &mut next.stories {
        let Some(before) = prev_index.get(story.id.as_str()) else {
            continue;
        };
        if story.status.rank() < before.status.rank() {
            messages.push(format!(
                "{}: status moved {} -> {}, restored",
                story.id,
                before.status.as_str(),
                story.status.as_str()
            ));
            story.status = before.status;
            story.completed_at = before.completed_at.clone();
        }
        if before.why_now.is_some() && story.why_now != before.why_now {
            messages.push(format!("{}: whyNow is immutable, restored", story.id));
            story.why_now = before.why_now.clone();
        }
    }

    messages.sort();
    messages
}

/// Mark a story done with a completion timestamp unless it already is.
pub fn mark_done(story: &mut Story, completed_at: String) -> bool {
    if story.status == StoryStatus::Done {
        return false;
    }
    story.status = StoryStatus::Done;
    story.completed_at = Some(completed_at);
    true
}
