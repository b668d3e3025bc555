//! Planning: ask the model for the next batch of stories and append them.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::ids::IdAllocator;
use crate::core::response::parse_plan_response;
use crate::core::types::{Ledger, Story};
use crate::io::ledger_store::{load_ledger_if_exists, write_ledger};
use crate::io::llm::Llm;
use crate::io::paths::{ProjectPaths, TastePaths};
use crate::io::prompt::{PLAN_SYSTEM, PlanPromptInputs, read_optional, render_plan_prompt};
use crate::io::taste::read_taste_profile;

/// Produces new stories for the project at `root`.
///
/// Implementations persist what they add to the ledger themselves and
/// return only the new stories. An empty batch means nothing is left worth
/// building, and is not an error.
pub trait Planner {
    fn plan(&self, root: &Path) -> Result<Vec<Story>>;
}

/// Planner backed by a one-shot model call.
pub struct LlmPlanner<L: Llm> {
    llm: L,
    taste: TastePaths,
}

impl<L: Llm> LlmPlanner<L> {
    pub fn new(llm: L, taste: TastePaths) -> Self {
        Self { llm, taste }
    }
}

impl<L: Llm> Planner for LlmPlanner<L> {
    fn plan(&self, root: &Path) -> Result<Vec<Story>> {
        let paths = ProjectPaths::new(root);
        let existing = load_ledger_if_exists(&paths.ledger_path)?;
        let taste = read_taste_profile(&self.taste.profile_path)?;
        let next_id = match &existing {
            Some(ledger) => IdAllocator::for_ledger(ledger).peek(),
            None => IdAllocator::for_ledger(&Ledger::new("", "")).peek(),
        };

        let prompt = render_plan_prompt(&PlanPromptInputs {
            ledger_summary: existing.as_ref().map(Ledger::summary_lines),
            taste,
            project_memory: read_optional(&paths.project_memory_path)?,
            product: read_optional(&paths.product_path)?,
            next_id,
        })?;
        let raw = self.llm.call(PLAN_SYSTEM, &prompt)?;
        let response = match parse_plan_response(&raw) {
            Ok(response) => response,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "plan reply unusable, adding nothing");
                return Ok(Vec::new());
            }
        };

        // Fresh read before writing; the model call can take a while.
        let mut ledger = match load_ledger_if_exists(&paths.ledger_path)? {
            Some(ledger) => ledger,
            None => Ledger::new(
                response
                    .project
                    .clone()
                    .unwrap_or_else(|| default_project_name(root)),
                response.description.clone().unwrap_or_default(),
            ),
        };

        let mut seen: HashSet<String> = ledger
            .stories
            .iter()
            .map(|story| normalize_title(&story.title))
            .collect();
        let mut allocator = IdAllocator::for_ledger(&ledger);
        let mut added = Vec::new();
        for proposed in response.stories {
            if !seen.insert(normalize_title(&proposed.title)) {
                warn!(title = %proposed.title, "planner repeated an existing story, skipping");
                continue;
            }
            added.push(proposed.into_story(allocator.allocate()));
        }
        if added.is_empty() {
            info!("planner proposed nothing new");
            return Ok(added);
        }

        ledger.stories.extend(added.iter().cloned());
        allocator.record(&mut ledger);
        write_ledger(&paths.ledger_path, &ledger)?;
        info!(added = added.len(), "planner appended stories");
        Ok(added)
    }
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

fn default_project_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StoryStatus;
    use crate::test_support::{ScriptedLlm, TestProject, done_story};

    const BATCH: &str = r#"{
        "project": "notes",
        "description": "A note taking app",
        "stories": [
            {"title": "Create note", "description": "As a user, I can create a note so that I remember", "acceptanceCriteria": ["note saved"], "whyNow": "core loop"},
            {"title": "Delete note", "description": "As a user, I can delete a note so that clutter goes", "acceptanceCriteria": ["note gone"]}
        ]
    }"#;

    fn planner(project: &TestProject, llm: ScriptedLlm) -> LlmPlanner<ScriptedLlm> {
        LlmPlanner::new(llm, project.taste.clone())
    }

    #[test]
    fn creates_ledger_on_first_plan() {
        let project = TestProject::without_ledger();
        let planner = planner(&project, ScriptedLlm::new().reply(BATCH));

        let added = planner.plan(project.root()).expect("plan");

        let ids: Vec<&str> = added.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["US-001", "US-002"]);
        let ledger = project.ledger();
        assert_eq!(ledger.project, "notes");
        assert_eq!(ledger.description, "A note taking app");
        assert_eq!(ledger.stories, added);
        assert!(ledger.stories.iter().all(|s| s.status == StoryStatus::Open));
        assert_eq!(ledger.stories[0].why_now.as_deref(), Some("core loop"));
    }

    #[test]
    fn appends_after_existing_and_skips_repeats() {
        let mut existing = done_story("US-007");
        existing.title = "Create note".to_string();
        let project = TestProject::new(vec![existing]);
        let planner = planner(&project, ScriptedLlm::new().reply(BATCH));

        let added = planner.plan(project.root()).expect("plan");

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, "US-008");
        assert_eq!(added[0].title, "Delete note");
        let ledger = project.ledger();
        assert_eq!(ledger.project, "demo");
        assert_eq!(ledger.stories.len(), 2);
        let (_, user) = &planner.llm.calls()[0];
        assert!(user.contains("Do not repeat any of them."));
    }

    #[test]
    fn empty_batch_is_not_an_error() {
        let project = TestProject::new(vec![done_story("US-001")]);
        let planner = planner(&project, ScriptedLlm::new().reply(r#"{"stories": []}"#));
        assert!(planner.plan(project.root()).expect("plan").is_empty());
        assert_eq!(project.ledger().stories.len(), 1);
    }

    #[test]
    fn malformed_reply_adds_nothing() {
        let project = TestProject::new(vec![done_story("US-001")]);
        let planner = planner(&project, ScriptedLlm::new().reply("no json here"));
        assert!(planner.plan(project.root()).expect("plan").is_empty());
    }

    #[test]
    fn model_failure_is_an_error() {
        let project = TestProject::new(vec![done_story("US-001")]);
        let planner = planner(&project, ScriptedLlm::new().fail("offline"));
        assert!(planner.plan(project.root()).is_err());
    }
}
