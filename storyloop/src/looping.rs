//! The build loop behind `storyloop build`.
//!
//! Each cycle: honor an interrupt, check the quota, apply queued steering,
//! re-read the ledger, then either build the next not-done story (with
//! retries) or, in loop mode, ask the planner for more. The deadline is only
//! checked before starting new work; a build in flight always finishes.

use std::collections::HashSet;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::budget::deadline_passed;
use crate::core::invariants::{enforce_monotonic, mark_done};
use crate::core::selector::next_story;
use crate::core::types::{Ledger, Story};
use crate::io::agent::{Activity, Agent, AgentLaunchError, AgentRequest};
use crate::io::config::{LockConfig, LoopSettings};
use crate::io::interrupt::Interrupt;
use crate::io::ledger_store::{load_ledger, write_ledger};
use crate::io::llm::Llm;
use crate::io::logs::{append_failure_note, timestamp};
use crate::io::paths::{ProjectPaths, TastePaths};
use crate::io::prompt::{BuildPromptInputs, PromptBuilder};
use crate::io::run_marker::RunMarker;
use crate::io::taste::read_taste_profile;
use crate::plan::Planner;
use crate::steer::{SteeringOutcome, apply_steering};
use crate::synthesis::record_synthesis;

/// Limits and policies for one `run_loop` call.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Stop after this many stories were built. `None` is unbounded.
    pub max_items: Option<u32>,
    /// Ask the planner for more stories when none are left.
    pub loop_mode: bool,
    /// Wall-clock budget, checked before starting new work.
    pub deadline: Option<Duration>,
    /// Delay before each retry; one retry per entry.
    pub retry_backoff: Vec<Duration>,
    pub prompt_budget_bytes: usize,
    pub lock: LockConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_settings(&LoopSettings::default())
    }
}

impl LoopConfig {
    pub fn from_settings(settings: &LoopSettings) -> Self {
        Self {
            max_items: None,
            loop_mode: false,
            deadline: None,
            retry_backoff: settings.retry.backoff(),
            prompt_budget_bytes: settings.prompt_budget_bytes,
            lock: settings.lock.clone(),
        }
    }

    fn max_attempts(&self) -> u32 {
        1 + self.retry_backoff.len() as u32
    }
}

/// Waits between build retries.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Everything the loop delegates to.
pub struct Collaborators<'a, A: Agent, L: Llm, P: Planner, S: Sleeper> {
    pub agent: &'a A,
    pub llm: &'a L,
    pub planner: &'a P,
    pub sleeper: &'a S,
    pub interrupt: &'a Interrupt,
}

/// Progress reported while the loop runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Steering(SteeringOutcome),
    Selected {
        id: String,
        title: String,
    },
    AttemptStarted {
        id: String,
        attempt: u32,
        max_attempts: u32,
    },
    Activity(Activity),
    AttemptFailed {
        id: String,
        attempt: u32,
        exit_code: Option<i32>,
        retry_in: Option<Duration>,
    },
    Built {
        id: String,
    },
    Skipped {
        id: String,
        attempts: u32,
    },
    Planning,
    Planned {
        added: Vec<String>,
    },
    LedgerCorrected {
        messages: Vec<String>,
    },
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No not-done story is left and loop mode is off.
    Complete,
    /// Loop mode is on and the planner had nothing to add.
    Exhausted,
    /// `max_items` stories were built.
    Quota,
    /// The wall-clock budget ran out.
    Deadline,
    /// The user pressed Ctrl-C.
    Interrupted,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Complete => "complete",
            StopReason::Exhausted => "exhausted",
            StopReason::Quota => "quota reached",
            StopReason::Deadline => "deadline reached",
            StopReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub stop: StopReason,
    /// Stories built successfully this run.
    pub built: u32,
    /// Plan/build cycles, starting at 1.
    pub cycles: u32,
    pub elapsed: Duration,
    /// Stories given up on after exhausting their attempts.
    pub skipped: Vec<String>,
}

enum BuildResult {
    Built { id: String },
    Skipped { attempts: u32 },
    /// The agent reported nothing left to build and the ledger agrees.
    NothingLeft,
}

/// Run build cycles until a stop condition holds.
///
/// Only configuration problems return `Err`: a missing ledger or taste
/// profile, an agent binary that cannot be launched, or a ledger that can no
/// longer be read. Individual story failures are retried and then skipped.
pub fn run_loop<A: Agent, L: Llm, P: Planner, S: Sleeper>(
    paths: &ProjectPaths,
    taste: &TastePaths,
    config: &LoopConfig,
    collaborators: &Collaborators<'_, A, L, P, S>,
    on_event: &mut dyn FnMut(LoopEvent),
) -> Result<LoopOutcome> {
    let started = Instant::now();
    load_ledger(&paths.ledger_path)?;
    read_taste_profile(&taste.profile_path)?;
    let _marker = RunMarker::acquire(&paths.run_marker_path)?;

    let mut built = 0u32;
    let mut cycles = 1u32;
    let mut skipped: Vec<String> = Vec::new();
    let mut skipped_set: HashSet<String> = HashSet::new();

    let stop = loop {
        if collaborators.interrupt.is_requested() {
            break StopReason::Interrupted;
        }
        if config.max_items.is_some_and(|max| built >= max) {
            break StopReason::Quota;
        }

        match apply_steering(paths, taste, collaborators.llm, &config.lock) {
            Ok(SteeringOutcome::NoInput) => {}
            Ok(outcome) => on_event(LoopEvent::Steering(outcome)),
            Err(err) => warn!(err = %format!("{err:#}"), "steering failed"),
        }

        let ledger = load_ledger(&paths.ledger_path)?;
        let Some(story) = next_story(&ledger, &skipped_set).cloned() else {
            if !config.loop_mode {
                break StopReason::Complete;
            }
            if deadline_passed(started, config.deadline, Instant::now()) {
                break StopReason::Deadline;
            }
            on_event(LoopEvent::Planning);
            match collaborators.planner.plan(&paths.root) {
                Ok(added) if !added.is_empty() => {
                    cycles += 1;
                    info!(added = added.len(), cycles, "planner added stories");
                    on_event(LoopEvent::Planned {
                        added: added.into_iter().map(|s| s.id).collect(),
                    });
                    continue;
                }
                Ok(_) => break StopReason::Exhausted,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "planner failed");
                    break StopReason::Exhausted;
                }
            }
        };

        if deadline_passed(started, config.deadline, Instant::now()) {
            break StopReason::Deadline;
        }

        on_event(LoopEvent::Selected {
            id: story.id.clone(),
            title: story.title.clone(),
        });
        match read_taste_profile(&taste.profile_path).and_then(|taste_text| {
            record_synthesis(paths, &ledger, &story, &taste_text, collaborators.llm)
        }) {
            Ok(()) => {}
            Err(err) => warn!(id = %story.id, err = %format!("{err:#}"), "synthesis skipped"),
        }

        match build_story(paths, taste, config, collaborators, &story, on_event)? {
            BuildResult::Built { id } => {
                built += 1;
                on_event(LoopEvent::Built { id });
            }
            BuildResult::NothingLeft => {}
            BuildResult::Skipped { attempts } => {
                skipped_set.insert(story.id.clone());
                skipped.push(story.id.clone());
                on_event(LoopEvent::Skipped {
                    id: story.id.clone(),
                    attempts,
                });
            }
        }

        let mut after = reload_after_agent(paths, &ledger)?;
        let messages = enforce_monotonic(&ledger, &mut after);
        if !messages.is_empty() {
            for message in &messages {
                warn!("{message}");
            }
            write_ledger(&paths.ledger_path, &after)?;
            on_event(LoopEvent::LedgerCorrected { messages });
        }
    };

    let outcome = LoopOutcome {
        stop,
        built,
        cycles,
        elapsed: started.elapsed(),
        skipped,
    };
    info!(stop = %outcome.stop, built, cycles, "loop stopped");
    Ok(outcome)
}

/// Build one story, retrying failed attempts with backoff.
fn build_story<A: Agent, L: Llm, P: Planner, S: Sleeper>(
    paths: &ProjectPaths,
    taste: &TastePaths,
    config: &LoopConfig,
    collaborators: &Collaborators<'_, A, L, P, S>,
    story: &Story,
    on_event: &mut dyn FnMut(LoopEvent),
) -> Result<BuildResult> {
    let max_attempts = config.max_attempts();
    let mut last_exit = None;

    for attempt in 1..=max_attempts {
        on_event(LoopEvent::AttemptStarted {
            id: story.id.clone(),
            attempt,
            max_attempts,
        });

        let before = load_ledger(&paths.ledger_path)?;
        let taste_text = read_taste_profile(&taste.profile_path)?;
        let inputs =
            BuildPromptInputs::load(paths, &taste.profile_path, taste_text, &before, story)?;
        let prompt = PromptBuilder::new(config.prompt_budget_bytes).build(&inputs)?;
        let request = AgentRequest {
            workdir: paths.root.clone(),
            prompt,
        };

        let invoked = collaborators
            .agent
            .invoke(&request, &mut |activity| on_event(LoopEvent::Activity(activity)));
        let run = match invoked {
            Ok(run) => Some(run),
            Err(err) if err.downcast_ref::<AgentLaunchError>().is_some() => return Err(err),
            Err(err) => {
                warn!(id = %story.id, attempt, err = %format!("{err:#}"), "agent invocation failed");
                None
            }
        };

        if let Some(run) = &run {
            last_exit = run.exit_code;
            if run.succeeded() {
                let mut after = reload_after_agent(paths, &before)?;
                if let Some(id) = newly_done(&before, &after).into_iter().next() {
                    return Ok(BuildResult::Built { id });
                }
                if run.story_complete {
                    // The agent claimed completion without recording it.
                    if let Some(target) = after.find_mut(&story.id) {
                        mark_done(target, timestamp());
                        write_ledger(&paths.ledger_path, &after)?;
                        info!(id = %story.id, "marked done on completion marker");
                        return Ok(BuildResult::Built {
                            id: story.id.clone(),
                        });
                    }
                }
                if run.all_complete && after.open_stories().next().is_none() {
                    info!(id = %story.id, "agent reported nothing left to build");
                    return Ok(BuildResult::NothingLeft);
                }
                if run.all_complete {
                    debug!(id = %story.id, "all-complete marker ignored, open stories remain");
                }
                warn!(id = %story.id, attempt, "agent exited cleanly without completing a story");
            }
        } else {
            last_exit = None;
        }

        let retry_in = config.retry_backoff.get(attempt as usize - 1).copied();
        on_event(LoopEvent::AttemptFailed {
            id: story.id.clone(),
            attempt,
            exit_code: run.as_ref().and_then(|r| r.exit_code),
            retry_in,
        });
        if let Some(delay) = retry_in {
            collaborators.sleeper.sleep(delay);
        }
    }

    if let Err(err) = append_failure_note(
        &paths.progress_path,
        story,
        max_attempts,
        last_exit,
        &timestamp(),
    ) {
        warn!(id = %story.id, err = %format!("{err:#}"), "failed to record skipped story");
    }
    warn!(id = %story.id, attempts = max_attempts, "story skipped");
    Ok(BuildResult::Skipped {
        attempts: max_attempts,
    })
}

/// Ids that are done in `after` but were not done in `before`, in ledger order.
fn newly_done(before: &Ledger, after: &Ledger) -> Vec<String> {
    after
        .stories
        .iter()
        .filter(|story| story.status.is_done())
        .filter(|story| before.find(&story.id).is_none_or(|prev| !prev.status.is_done()))
        .map(|story| story.id.clone())
        .collect()
}

/// Re-read the ledger the agent may have rewritten; restore `previous` if it is unreadable.
fn reload_after_agent(paths: &ProjectPaths, previous: &Ledger) -> Result<Ledger> {
    match load_ledger(&paths.ledger_path) {
        Ok(ledger) => Ok(ledger),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "ledger unreadable after agent run, restoring previous version");
            write_ledger(&paths.ledger_path, previous).context("restore ledger")?;
            Ok(previous.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StoryStatus;
    use crate::test_support::{
        AgentStep, RecordingSleeper, ScriptedAgent, ScriptedLlm, ScriptedPlanner, TestProject,
        done_story, open_story,
    };

    fn config() -> LoopConfig {
        LoopConfig {
            retry_backoff: vec![Duration::from_secs(10), Duration::from_secs(30)],
            ..LoopConfig::default()
        }
    }

    fn run(
        project: &TestProject,
        config: &LoopConfig,
        agent: &ScriptedAgent,
        sleeper: &RecordingSleeper,
    ) -> (LoopOutcome, Vec<LoopEvent>) {
        let llm = ScriptedLlm::new();
        let planner = ScriptedPlanner::new(&project.paths);
        let interrupt = Interrupt::new();
        let collaborators = Collaborators {
            agent,
            llm: &llm,
            planner: &planner,
            sleeper,
            interrupt: &interrupt,
        };
        let mut events = Vec::new();
        let outcome = run_loop(
            &project.paths,
            &project.taste,
            config,
            &collaborators,
            &mut |event| events.push(event),
        )
        .expect("run loop");
        (outcome, events)
    }

    #[test]
    fn marker_only_completion_marks_story_done() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let agent = ScriptedAgent::new(&project.paths, vec![AgentStep::marker_only()]);
        let sleeper = RecordingSleeper::new();

        let (outcome, events) = run(&project, &config(), &agent, &sleeper);

        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.built, 1);
        let ledger = project.ledger();
        let story = ledger.find("US-001").expect("story");
        assert_eq!(story.status, StoryStatus::Done);
        assert!(story.completed_at.is_some());
        assert!(events.contains(&LoopEvent::Built {
            id: "US-001".to_string()
        }));
    }

    #[test]
    fn clean_exit_without_completion_counts_as_failure() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let agent = ScriptedAgent::new(
            &project.paths,
            vec![AgentStep::silent(), AgentStep::silent(), AgentStep::silent()],
        );
        let sleeper = RecordingSleeper::new();

        let (outcome, _) = run(&project, &config(), &agent, &sleeper);

        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.built, 0);
        assert_eq!(outcome.skipped, vec!["US-001".to_string()]);
        assert_eq!(agent.invocations(), 3);
        assert_eq!(project.status_of("US-001"), StoryStatus::Open);
    }

    #[test]
    fn agent_building_a_different_story_still_counts() {
        let project = TestProject::new(vec![open_story("US-001"), open_story("US-002")]);
        let step = AgentStep::silent().editing(|ledger| {
            if let Some(story) = ledger.find_mut("US-002") {
                mark_done(story, "2026-10-18T12:00:00Z".to_string());
            }
        });
        let agent = ScriptedAgent::new(&project.paths, vec![step]);
        let sleeper = RecordingSleeper::new();
        let config = LoopConfig {
            max_items: Some(1),
            ..config()
        };

        let (outcome, events) = run(&project, &config, &agent, &sleeper);

        assert_eq!(outcome.stop, StopReason::Quota);
        assert_eq!(outcome.built, 1);
        assert!(events.contains(&LoopEvent::Built {
            id: "US-002".to_string()
        }));
        assert_eq!(project.status_of("US-001"), StoryStatus::Open);
    }

    #[test]
    fn regressed_status_is_restored_after_build() {
        let project = TestProject::new(vec![done_story("US-001"), open_story("US-002")]);
        let step = AgentStep::success().editing(|ledger| {
            if let Some(story) = ledger.find_mut("US-001") {
                story.status = StoryStatus::Open;
                story.completed_at = None;
            }
        });
        let agent = ScriptedAgent::new(&project.paths, vec![step]);
        let sleeper = RecordingSleeper::new();
        let config = LoopConfig {
            max_items: Some(1),
            ..config()
        };

        let (_, events) = run(&project, &config, &agent, &sleeper);

        assert_eq!(project.status_of("US-001"), StoryStatus::Done);
        assert_eq!(project.status_of("US-002"), StoryStatus::Done);
        assert!(events.iter().any(|e| matches!(e, LoopEvent::LedgerCorrected { .. })));
    }

    #[test]
    fn unreadable_ledger_after_agent_is_restored() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let before = project.ledger();
        std::fs::write(&project.paths.ledger_path, "{ not json").expect("corrupt");

        let restored = reload_after_agent(&project.paths, &before).expect("reload");

        assert_eq!(restored, before);
        assert_eq!(project.ledger(), before);
    }

    #[test]
    fn newly_done_ignores_stories_already_done() {
        let before = crate::test_support::ledger_with(vec![done_story("US-001"), open_story("US-002")]);
        let mut after = before.clone();
        after.stories.push(done_story("US-003"));
        assert_eq!(newly_done(&before, &after), vec!["US-003".to_string()]);
    }

    #[test]
    fn all_complete_with_empty_backlog_ends_without_retries() {
        let project = TestProject::new(vec![done_story("US-001"), open_story("US-002")]);
        // The user removed the last open story while the agent ran.
        let step = AgentStep::all_complete()
            .editing(|ledger| ledger.stories.retain(|s| s.status.is_done()));
        let agent = ScriptedAgent::new(&project.paths, vec![step]);
        let sleeper = RecordingSleeper::new();

        let (outcome, events) = run(&project, &config(), &agent, &sleeper);

        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.built, 0);
        assert!(outcome.skipped.is_empty());
        assert_eq!(agent.invocations(), 1);
        assert!(sleeper.slept().is_empty());
        assert_eq!(project.progress(), "");
        assert!(!events.iter().any(|e| matches!(e, LoopEvent::AttemptFailed { .. })));
    }

    #[test]
    fn all_complete_with_open_stories_is_a_failed_attempt() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let agent = ScriptedAgent::new(
            &project.paths,
            vec![
                AgentStep::all_complete(),
                AgentStep::all_complete(),
                AgentStep::all_complete(),
            ],
        );
        let sleeper = RecordingSleeper::new();

        let (outcome, _) = run(&project, &config(), &agent, &sleeper);

        assert_eq!(outcome.skipped, vec!["US-001".to_string()]);
        assert_eq!(sleeper.slept().len(), 2);
    }

    #[test]
    fn launch_error_is_fatal() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let agent = ScriptedAgent::new(&project.paths, vec![AgentStep::launch_error()]);
        let llm = ScriptedLlm::new();
        let planner = ScriptedPlanner::new(&project.paths);
        let sleeper = RecordingSleeper::new();
        let interrupt = Interrupt::new();
        let collaborators = Collaborators {
            agent: &agent,
            llm: &llm,
            planner: &planner,
            sleeper: &sleeper,
            interrupt: &interrupt,
        };

        let err = run_loop(
            &project.paths,
            &project.taste,
            &config(),
            &collaborators,
            &mut |_| {},
        )
        .unwrap_err();

        assert!(err.downcast_ref::<AgentLaunchError>().is_some());
        assert!(sleeper.slept().is_empty());
        assert!(!project.paths.run_marker_path.exists());
    }

    #[test]
    fn activities_are_forwarded() {
        let project = TestProject::new(vec![open_story("US-001")]);
        let step = AgentStep::success().emitting(Activity::Tool {
            label: "Reading file".to_string(),
        });
        let agent = ScriptedAgent::new(&project.paths, vec![step]);
        let sleeper = RecordingSleeper::new();

        let (_, events) = run(&project, &config(), &agent, &sleeper);

        assert!(events.contains(&LoopEvent::Activity(Activity::Tool {
            label: "Reading file".to_string()
        })));
    }

    #[test]
    fn build_prompt_names_selected_story() {
        let project = TestProject::new(vec![done_story("US-001"), open_story("US-002")]);
        let agent = ScriptedAgent::new(&project.paths, vec![AgentStep::success()]);
        let sleeper = RecordingSleeper::new();

        run(&project, &config(), &agent, &sleeper);

        let prompt = &agent.prompts()[0];
        assert!(prompt.contains("Suggested pick: US-002"));
        assert!(prompt.contains("Prefers small, boring"));
        assert!(prompt.contains("\"userStories\""));
    }

    #[test]
    fn stop_reasons_render_for_humans() {
        assert_eq!(StopReason::Quota.to_string(), "quota reached");
        assert_eq!(StopReason::Complete.to_string(), "complete");
    }
}
