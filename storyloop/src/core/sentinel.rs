//! Completion markers embedded in agent text.
//!
//! The build prompt tells the agent to print one of these literals when it
//! finishes. They are protocol, not prose: detect them on the raw text and
//! strip them from anything shown to the user.

/// The agent finished the story it picked.
pub const STORY_COMPLETE: &str = "<loop>STORY_COMPLETE</loop>";
/// The agent found no not-done stories left in the ledger.
pub const ALL_COMPLETE: &str = "<loop>ALL_COMPLETE</loop>";

/// Agent text with markers detected and removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reduced {
    pub text: String,
    pub story_complete: bool,
    pub all_complete: bool,
}

/// Detect both markers in the concatenated agent text and strip them.
pub fn reduce(raw: &str) -> Reduced {
    Reduced {
        story_complete: raw.contains(STORY_COMPLETE),
        all_complete: raw.contains(ALL_COMPLETE),
        text: strip_sentinels(raw),
    }
}

pub fn strip_sentinels(text: &str) -> String {
    text.replace(STORY_COMPLETE, "").replace(ALL_COMPLETE, "")
}

/// Strips markers from streamed fragments for live display.
///
/// A fragment ending in what could be the start of a marker is held back
/// until the next fragment decides it.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    pending: String,
}

impl MarkerFilter {
    /// Feed one fragment; returns the text that is safe to show now.
    pub fn push(&mut self, fragment: &str) -> String {
        self.pending.push_str(fragment);
        let cleaned = strip_sentinels(&self.pending);
        let split = cleaned.len() - partial_marker_len(&cleaned);
        self.pending = cleaned[split..].to_string();
        cleaned[..split].to_string()
    }

    /// Release whatever was held back; the stream has ended.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of a marker.
fn partial_marker_len(text: &str) -> usize {
    [STORY_COMPLETE, ALL_COMPLETE]
        .iter()
        .filter_map(|marker| (1..marker.len()).rev().find(|&n| text.ends_with(&marker[..n])))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_detects_and_strips_story_marker() {
        let raw = format!("Implemented login.\n{STORY_COMPLETE}\n");
        let reduced = reduce(&raw);
        assert!(reduced.story_complete);
        assert!(!reduced.all_complete);
        assert_eq!(reduced.text, "Implemented login.\n\n");
    }

    #[test]
    fn reduce_detects_marker_split_across_fragments_once_joined() {
        let fragments = ["done <loop>ALL_", "COMPLETE</loop>"];
        let reduced = reduce(&fragments.concat());
        assert!(reduced.all_complete);
        assert_eq!(reduced.text, "done ");
    }

    #[test]
    fn filter_hides_marker_split_across_fragments() {
        let mut filter = MarkerFilter::default();
        let mut shown = filter.push("Done. <loop>STORY_");
        assert_eq!(shown, "Done. ");
        shown.push_str(&filter.push("COMPLETE</loop> bye"));
        shown.push_str(&filter.finish());
        assert_eq!(shown, "Done.  bye");
    }

    #[test]
    fn filter_releases_lookalike_prefix() {
        let mut filter = MarkerFilter::default();
        assert_eq!(filter.push("a <lo"), "a ");
        assert_eq!(filter.push("ng> b"), "<long> b");
        assert_eq!(filter.finish(), "");

        assert_eq!(filter.push("tail <loop>ALL"), "tail ");
        assert_eq!(filter.finish(), "<loop>ALL");
    }

    #[test]
    fn plain_text_is_untouched() {
        let reduced = reduce("still working on STORY_COMPLETE wiring");
        assert!(!reduced.story_complete);
        assert_eq!(reduced.text, "still working on STORY_COMPLETE wiring");
    }
}
