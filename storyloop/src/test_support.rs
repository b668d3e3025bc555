//! Scripted collaborators and fixtures for driving the loop without real processes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::invariants::mark_done;
use crate::core::types::{Ledger, Story, StoryStatus};
use crate::io::agent::{Activity, Agent, AgentLaunchError, AgentRequest, AgentRun};
use crate::io::interrupt::Interrupt;
use crate::io::ledger_store::{load_ledger, write_ledger};
use crate::io::llm::Llm;
use crate::io::paths::{ProjectPaths, TastePaths};
use crate::looping::Sleeper;
use crate::plan::Planner;

pub const TASTE_TEXT: &str = "# Taste\n\nPrefers small, boring, well-tested changes.\n";

/// Create a deterministic story with the given status.
pub fn story(id: &str, status: StoryStatus) -> Story {
    Story {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("As a user, I can use {id} so that it helps"),
        acceptance_criteria: vec![format!("{id} works")],
        completed_at: status
            .is_done()
            .then(|| "2026-10-18T08:00:00Z".to_string()),
        status,
        why_now: None,
    }
}

pub fn open_story(id: &str) -> Story {
    story(id, StoryStatus::Open)
}

pub fn done_story(id: &str) -> Story {
    story(id, StoryStatus::Done)
}

pub fn ledger_with(stories: Vec<Story>) -> Ledger {
    Ledger {
        stories,
        ..Ledger::new("demo", "A demo project")
    }
}

/// Temporary project root with a ledger and a taste profile.
pub struct TestProject {
    _temp: TempDir,
    pub paths: ProjectPaths,
    pub taste: TastePaths,
}

impl TestProject {
    pub fn new(stories: Vec<Story>) -> Self {
        let project = Self::without_ledger();
        write_ledger(&project.paths.ledger_path, &ledger_with(stories)).expect("write ledger");
        project
    }

    /// Project with a taste profile but no `prd.json` yet.
    pub fn without_ledger() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path().join("project"));
        fs::create_dir_all(&paths.state_dir).expect("state dir");
        let taste = TastePaths::new(temp.path().join("home/.storyloop/taste.md"));
        if let Some(parent) = taste.profile_path.parent() {
            fs::create_dir_all(parent).expect("taste dir");
        }
        fs::write(&taste.profile_path, TASTE_TEXT).expect("write taste");
        Self {
            _temp: temp,
            paths,
            taste,
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn ledger(&self) -> Ledger {
        load_ledger(&self.paths.ledger_path).expect("load ledger")
    }

    pub fn status_of(&self, id: &str) -> StoryStatus {
        self.ledger().find(id).expect("story in ledger").status
    }

    pub fn write_steering(&self, text: &str) {
        fs::write(&self.paths.steer_path, text).expect("write steering");
    }

    pub fn steering(&self) -> String {
        read_or_empty(&self.paths.steer_path)
    }

    pub fn taste_text(&self) -> String {
        read_or_empty(&self.taste.profile_path)
    }

    pub fn progress(&self) -> String {
        read_or_empty(&self.paths.progress_path)
    }

    pub fn synthesis(&self) -> String {
        read_or_empty(&self.paths.synthesis_path)
    }
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Model that replays queued replies in order and records every call.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: RefCell<VecDeque<std::result::Result<String, String>>>,
    calls: RefCell<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies.borrow_mut().push_back(Ok(text.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.replies.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    /// `(system, user)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.borrow().clone()
    }
}

impl Llm for ScriptedLlm {
    fn call(&self, system: &str, user: &str) -> Result<String> {
        self.calls
            .borrow_mut()
            .push((system.to_string(), user.to_string()));
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted model reply left")),
        }
    }
}

type LedgerEdit = Box<dyn Fn(&mut Ledger)>;

/// One scripted agent invocation.
pub struct AgentStep {
    exit_code: Option<i32>,
    text: String,
    story_complete: bool,
    all_complete: bool,
    complete_first_open: bool,
    edit: Option<LedgerEdit>,
    interrupt: Option<Interrupt>,
    delay: Option<Duration>,
    activities: Vec<Activity>,
    launch_error: bool,
}

impl AgentStep {
    fn base(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            text: String::new(),
            story_complete: false,
            all_complete: false,
            complete_first_open: false,
            edit: None,
            interrupt: None,
            delay: None,
            activities: Vec::new(),
            launch_error: false,
        }
    }

    /// Marks the first not-done story done and reports the story marker.
    pub fn success() -> Self {
        Self {
            text: "Built it.".to_string(),
            story_complete: true,
            complete_first_open: true,
            ..Self::base(Some(0))
        }
    }

    /// Reports the story marker without touching the ledger.
    pub fn marker_only() -> Self {
        Self {
            text: "Built it.".to_string(),
            story_complete: true,
            ..Self::base(Some(0))
        }
    }

    /// Reports the all-complete marker without touching the ledger.
    pub fn all_complete() -> Self {
        Self {
            text: "Nothing left to do.".to_string(),
            all_complete: true,
            ..Self::base(Some(0))
        }
    }

    /// Exits 0 but neither edits the ledger nor reports completion.
    pub fn silent() -> Self {
        Self::base(Some(0))
    }

    pub fn failure(exit_code: i32) -> Self {
        Self::base(Some(exit_code))
    }

    pub fn launch_error() -> Self {
        Self {
            launch_error: true,
            ..Self::base(None)
        }
    }

    /// Request an interrupt while this invocation is running.
    pub fn interrupting(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = Some(interrupt.clone());
        self
    }

    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn editing(mut self, edit: impl Fn(&mut Ledger) + 'static) -> Self {
        self.edit = Some(Box::new(edit));
        self
    }

    pub fn emitting(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }
}

/// Agent that plays back [`AgentStep`]s against the project ledger.
pub struct ScriptedAgent {
    ledger_path: PathBuf,
    steps: RefCell<VecDeque<AgentStep>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(paths: &ProjectPaths, steps: Vec<AgentStep>) -> Self {
        Self {
            ledger_path: paths.ledger_path.clone(),
            steps: RefCell::new(steps.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(
        &self,
        request: &AgentRequest,
        on_activity: &mut dyn FnMut(Activity),
    ) -> Result<AgentRun> {
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted agent step left"))?;
        if step.launch_error {
            return Err(AgentLaunchError {
                program: "scripted-agent".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }
            .into());
        }
        self.prompts.borrow_mut().push(request.prompt.clone());

        if let Some(interrupt) = &step.interrupt {
            interrupt.request();
        }
        for activity in step.activities {
            on_activity(activity);
        }
        if let Some(delay) = step.delay {
            thread::sleep(delay);
        }
        if step.complete_first_open || step.edit.is_some() {
            let mut ledger = load_ledger(&self.ledger_path)?;
            if step.complete_first_open
                && let Some(story) = ledger.stories.iter_mut().find(|s| !s.status.is_done())
            {
                mark_done(story, "2026-10-18T12:00:00Z".to_string());
            }
            if let Some(edit) = &step.edit {
                edit(&mut ledger);
            }
            write_ledger(&self.ledger_path, &ledger)?;
        }

        Ok(AgentRun {
            text: step.text,
            exit_code: step.exit_code,
            story_complete: step.story_complete,
            all_complete: step.all_complete,
        })
    }
}

/// Planner that appends queued batches to the ledger, like the real one.
pub struct ScriptedPlanner {
    ledger_path: PathBuf,
    batches: RefCell<VecDeque<std::result::Result<Vec<Story>, String>>>,
    calls: RefCell<u32>,
}

impl ScriptedPlanner {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            ledger_path: paths.ledger_path.clone(),
            batches: RefCell::new(VecDeque::new()),
            calls: RefCell::new(0),
        }
    }

    pub fn batch(self, stories: Vec<Story>) -> Self {
        self.batches.borrow_mut().push_back(Ok(stories));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.batches.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.borrow()
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, _root: &Path) -> Result<Vec<Story>> {
        *self.calls.borrow_mut() += 1;
        let stories = match self.batches.borrow_mut().pop_front() {
            Some(Ok(stories)) => stories,
            Some(Err(message)) => return Err(anyhow!(message)),
            None => Vec::new(),
        };
        if !stories.is_empty() {
            let mut ledger = load_ledger(&self.ledger_path)?;
            ledger.stories.extend(stories.iter().cloned());
            write_ledger(&self.ledger_path, &ledger)?;
        }
        Ok(stories)
    }
}

/// Sleeper that records requested delays instead of waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}
