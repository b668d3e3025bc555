//! Priority justification logged before each story build.

use anyhow::Result;
use tracing::debug;

use crate::core::types::{Ledger, Story};
use crate::io::llm::Llm;
use crate::io::logs::{append_synthesis, timestamp};
use crate::io::paths::ProjectPaths;
use crate::io::prompt::{SYNTHESIS_SYSTEM, render_synthesis_prompt};

/// Ask the model why `story` comes next and append the answer to the synthesis log.
pub fn record_synthesis<L: Llm + ?Sized>(
    paths: &ProjectPaths,
    ledger: &Ledger,
    story: &Story,
    taste: &str,
    llm: &L,
) -> Result<()> {
    let prompt = render_synthesis_prompt(&ledger.summary_lines(), story, taste)?;
    let paragraph = llm.call(SYNTHESIS_SYSTEM, &prompt)?;
    append_synthesis(&paths.synthesis_path, story, &paragraph, &timestamp())?;
    debug!(id = %story.id, "synthesis entry written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedLlm, TestProject, open_story};

    #[test]
    fn appends_heading_and_paragraph() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let ledger = project.ledger();
        let llm = ScriptedLlm::new().reply("Login unblocks everything else.\n");

        record_synthesis(&project.paths, &ledger, &ledger.stories[0], "taste", &llm)
            .expect("synthesis");

        let log = project.synthesis();
        assert!(log.starts_with("## "), "{log}");
        assert!(log.contains(" US-001: US-001 title\n\nLogin unblocks everything else.\n"));
        let (_, user) = &llm.calls()[0];
        assert!(user.contains("About to build US-001"));
    }

    #[test]
    fn model_failure_writes_nothing() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let ledger = project.ledger();
        let llm = ScriptedLlm::new().fail("offline");

        assert!(record_synthesis(&project.paths, &ledger, &ledger.stories[0], "t", &llm).is_err());
        assert_eq!(project.synthesis(), "");
    }
}
