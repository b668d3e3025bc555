//! Ledger data model shared by every component.
//!
//! These types mirror `prd.json` on disk. The agent process edits that file
//! directly, so deserialization tolerates fields it does not know about.

use serde::{Deserialize, Serialize};

/// Lifecycle of a single story. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Open,
    InProgress,
    Done,
}

impl StoryStatus {
    /// Position in the forward order `open < in_progress < done`.
    pub fn rank(self) -> u8 {
        match self {
            StoryStatus::Open => 0,
            StoryStatus::InProgress => 1,
            StoryStatus::Done => 2,
        }
    }

    pub fn is_done(self) -> bool {
        self == StoryStatus::Done
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Open => "open",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Done => "done",
        }
    }
}

/// One unit of work in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_now: Option<String>,
}

/// The persisted ledger document (`prd.json`).
///
/// Story order is priority order. Nothing in this crate reorders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "userStories", alias = "stories", default)]
    pub stories: Vec<Story>,
    /// High-water mark for id allocation, so ids of deleted stories are never reissued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sequence: Option<u32>,
}

impl Ledger {
    pub fn new(project: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            description: description.into(),
            stories: Vec::new(),
            next_sequence: None,
        }
    }

    pub fn find(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|story| story.id == id)
    }

    /// Stories that still need work, in priority order.
    pub fn open_stories(&self) -> impl Iterator<Item = &Story> {
        self.stories.iter().filter(|story| !story.status.is_done())
    }

    pub fn count_done(&self) -> usize {
        self.stories.iter().filter(|s| s.status.is_done()).count()
    }

    /// Compact `id | title | status` lines used where full criteria would bloat a prompt.
    pub fn summary_lines(&self) -> String {
        self.stories
            .iter()
            .map(|story| {
                format!(
                    "- {} | {} | {}",
                    story.id,
                    story.title,
                    story.status.as_str()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_serializes_with_camel_case_and_omits_absent_fields() {
        let story = Story {
            id: "US-001".to_string(),
            title: "Login".to_string(),
            description: "As a user, I can log in so that I see my data".to_string(),
            acceptance_criteria: vec!["form renders".to_string()],
            status: StoryStatus::InProgress,
            completed_at: None,
            why_now: None,
        };

        let json = serde_json::to_value(&story).expect("serialize");
        assert_eq!(json["acceptanceCriteria"][0], "form renders");
        assert_eq!(json["status"], "in_progress");
        assert!(json.get("completedAt").is_none());
        assert!(json.get("whyNow").is_none());
    }

    #[test]
    fn ledger_reads_stories_alias_and_ignores_unknown_fields() {
        let raw = r#"{
            "project": "demo",
            "stories": [
                {"id": "US-001", "title": "a", "status": "done", "completedAt": "2026-01-01T00:00:00Z", "passes": true}
            ]
        }"#;

        let ledger: Ledger = serde_json::from_str(raw).expect("parse");
        assert_eq!(ledger.stories.len(), 1);
        assert_eq!(ledger.stories[0].status, StoryStatus::Done);
        assert_eq!(ledger.description, "");
    }

    #[test]
    fn open_stories_skips_done_and_keeps_order() {
        let mut ledger = Ledger::new("demo", "");
        for (id, status) in [
            ("US-001", StoryStatus::Done),
            ("US-002", StoryStatus::InProgress),
            ("US-003", StoryStatus::Open),
        ] {
            ledger.stories.push(Story {
                id: id.to_string(),
                title: id.to_string(),
                description: String::new(),
                acceptance_criteria: Vec::new(),
                status,
                completed_at: None,
                why_now: None,
            });
        }

        let open: Vec<&str> = ledger.open_stories().map(|s| s.id.as_str()).collect();
        assert_eq!(open, vec!["US-002", "US-003"]);
        assert_eq!(ledger.count_done(), 1);
    }

    #[test]
    fn rank_is_forward_ordered() {
        assert!(StoryStatus::Open.rank() < StoryStatus::InProgress.rank());
        assert!(StoryStatus::InProgress.rank() < StoryStatus::Done.rank());
    }
}
