//! Read-only view of the ledger for `storyloop status`.

use std::collections::HashSet;

use anyhow::Result;

use crate::core::selector::next_story;
use crate::core::types::Story;
use crate::io::ledger_store::load_ledger;
use crate::io::paths::ProjectPaths;
use crate::io::run_marker::read_marker_pid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub project: String,
    pub total: usize,
    pub done: usize,
    /// Not-done stories in priority order.
    pub remaining: Vec<Story>,
    /// What the next build would pick.
    pub next: Option<Story>,
    /// Pid from the run marker when a build loop is active.
    pub active_pid: Option<u32>,
    pub steering_queued: bool,
}

pub fn status_report(paths: &ProjectPaths) -> Result<StatusReport> {
    let ledger = load_ledger(&paths.ledger_path)?;
    let steering_queued = std::fs::read_to_string(&paths.steer_path)
        .map(|text| !text.trim().is_empty())
        .unwrap_or(false);
    Ok(StatusReport {
        project: ledger.project.clone(),
        total: ledger.stories.len(),
        done: ledger.count_done(),
        remaining: ledger.open_stories().cloned().collect(),
        next: next_story(&ledger, &HashSet::new()).cloned(),
        active_pid: read_marker_pid(&paths.run_marker_path),
        steering_queued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StoryStatus;
    use crate::test_support::{TestProject, done_story, open_story, story};

    #[test]
    fn reports_counts_and_next_story() {
        let project = TestProject::new(vec![
            done_story("US-001"),
            story("US-002", StoryStatus::InProgress),
            open_story("US-003"),
        ]);
        project.write_steering("more tests please");

        let report = status_report(&project.paths).expect("status");

        assert_eq!(report.project, "demo");
        assert_eq!(report.total, 3);
        assert_eq!(report.done, 1);
        assert_eq!(report.remaining.len(), 2);
        assert_eq!(report.next.map(|s| s.id), Some("US-002".to_string()));
        assert_eq!(report.active_pid, None);
        assert!(report.steering_queued);
    }

    #[test]
    fn finished_ledger_has_no_next_story() {
        let project = TestProject::new(vec![done_story("US-001")]);
        let report = status_report(&project.paths).expect("status");
        assert!(report.next.is_none());
        assert!(!report.steering_queued);
    }
}
