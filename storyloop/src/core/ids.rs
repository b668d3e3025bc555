//! Story identifier allocation.

use crate::core::types::Ledger;

pub const ID_PREFIX: &str = "US-";
const ID_WIDTH: usize = 3;

/// Render a sequence number as a story id (`US-007`).
pub fn format_id(sequence: u32) -> String {
    format!("{ID_PREFIX}{sequence:0width$}", width = ID_WIDTH)
}

/// Extract the sequence number from a story id, if it has the expected shape.
pub fn parse_sequence(id: &str) -> Option<u32> {
    let digits = id.strip_prefix(ID_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// First sequence number that has never been issued for this ledger.
pub fn next_sequence(ledger: &Ledger) -> u32 {
    let from_ids = ledger
        .stories
        .iter()
        .filter_map(|story| parse_sequence(&story.id))
        .max()
        .map_or(1, |max| max.saturating_add(1));
    from_ids.max(ledger.next_sequence.unwrap_or(1))
}

/// Issues strictly increasing ids for stories appended to a ledger.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn for_ledger(ledger: &Ledger) -> Self {
        Self {
            next: next_sequence(ledger),
        }
    }

    /// Id the next call to [`IdAllocator::allocate`] will return.
    pub fn peek(&self) -> String {
        format_id(self.next)
    }

    pub fn allocate(&mut self) -> String {
        let id = format_id(self.next);
        self.next = self.next.saturating_add(1);
        id
    }

    /// Persist the high-water mark so removed stories never have their ids reissued.
    pub fn record(&self, ledger: &mut Ledger) {
        let current = ledger.next_sequence.unwrap_or(1);
        ledger.next_sequence = Some(current.max(self.next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Story, StoryStatus};

    fn ledger_with(ids: &[&str]) -> Ledger {
        let mut ledger = Ledger::new("demo", "");
        for id in ids {
            ledger.stories.push(Story {
                id: id.to_string(),
                title: id.to_string(),
                description: String::new(),
                acceptance_criteria: Vec::new(),
                status: StoryStatus::Open,
                completed_at: None,
                why_now: None,
            });
        }
        ledger
    }

    #[test]
    fn format_and_parse_agree() {
        assert_eq!(format_id(7), "US-007");
        assert_eq!(format_id(1234), "US-1234");
        assert_eq!(parse_sequence("US-007"), Some(7));
        assert_eq!(parse_sequence("US-"), None);
        assert_eq!(parse_sequence("TASK-1"), None);
        assert_eq!(parse_sequence("US-1a"), None);
    }

    #[test]
    fn next_sequence_starts_at_one_for_empty_ledger() {
        assert_eq!(next_sequence(&Ledger::new("demo", "")), 1);
    }

    #[test]
    fn next_sequence_ignores_foreign_ids_and_gaps() {
        let ledger = ledger_with(&["US-002", "custom", "US-010"]);
        assert_eq!(next_sequence(&ledger), 11);
    }

    #[test]
    fn high_water_mark_prevents_reuse_after_removal() {
        let mut ledger = ledger_with(&["US-001", "US-002", "US-003"]);
        let mut alloc = IdAllocator::for_ledger(&ledger);
        assert_eq!(alloc.allocate(), "US-004");
        alloc.record(&mut ledger);

        // User deletes everything after US-001.
        ledger.stories.truncate(1);
        assert_eq!(next_sequence(&ledger), 5);
    }

    #[test]
    fn allocator_is_strictly_increasing() {
        let ledger = ledger_with(&["US-005"]);
        let mut alloc = IdAllocator::for_ledger(&ledger);
        assert_eq!(alloc.peek(), "US-006");
        let ids: Vec<String> = (0..3).map(|_| alloc.allocate()).collect();
        assert_eq!(ids, vec!["US-006", "US-007", "US-008"]);
    }
}
