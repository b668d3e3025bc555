//! Prompt rendering for the agent and the one-shot model calls.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::sentinel::{ALL_COMPLETE, STORY_COMPLETE};
use crate::core::types::{Ledger, Story};
use crate::io::paths::ProjectPaths;

const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const STEER_TEMPLATE: &str = include_str!("prompts/steer.md");
const SYNTHESIS_TEMPLATE: &str = include_str!("prompts/synthesis.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

pub const STEER_SYSTEM: &str = "You turn a user's free-text guidance into ledger updates for an autonomous build loop. Respond with strict JSON only: no prose, no code fences.";
pub const SYNTHESIS_SYSTEM: &str =
    "You are a product lead explaining build priorities in plain, concrete language.";
pub const PLAN_SYSTEM: &str = "You plan small, shippable user stories for an autonomous build loop. Respond with strict JSON only: no prose, no code fences.";

const TRUNCATED_MARKER: &str = "\n[truncated]";

/// Selected story context for template rendering.
#[derive(Debug, Clone, Serialize)]
struct SelectedStoryContext {
    id: String,
    title: String,
    description: String,
    acceptance: Vec<String>,
    why_now: Option<String>,
}

impl SelectedStoryContext {
    fn from_story(story: &Story) -> Self {
        Self {
            id: story.id.clone(),
            title: story.title.clone(),
            description: story.description.clone(),
            acceptance: story.acceptance_criteria.clone(),
            why_now: story.why_now.clone(),
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("build", BUILD_TEMPLATE)
            .expect("build template should be valid");
        env.add_template("steer", STEER_TEMPLATE)
            .expect("steer template should be valid");
        env.add_template("synthesis", SYNTHESIS_TEMPLATE)
            .expect("synthesis template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        Self { env }
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content without its marker.
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex should compile")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, content_start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(next_start, ..)| *next_start);
        let content = rendered[*content_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop optional sections until the prompt fits, then truncate the last one.
///
/// Drop order: product -> memory -> progress.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["product", "memory", "progress"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let over = total_len(sections);
    if over <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let other_len = over - last.content.len();
    let allowed = budget.saturating_sub(other_len);
    let before_len = last.content.len();
    if allowed > TRUNCATED_MARKER.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATED_MARKER.len());
        last.content.push_str(TRUNCATED_MARKER);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Everything the build prompt is assembled from.
#[derive(Debug, Clone)]
pub struct BuildPromptInputs {
    /// Story the loop suggests the agent should take.
    pub selected: Story,
    /// File name shown next to the taste profile.
    pub taste_name: String,
    pub taste: String,
    /// Full ledger, serialized.
    pub ledger_json: String,
    pub progress: Option<String>,
    pub project_memory: Option<String>,
    pub product: Option<String>,
}

impl BuildPromptInputs {
    /// Collect prompt inputs, reading the optional narrative files fresh.
    pub fn load(
        paths: &ProjectPaths,
        taste_path: &Path,
        taste: String,
        ledger: &Ledger,
        selected: &Story,
    ) -> Result<Self> {
        let taste_name = taste_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| taste_path.display().to_string());
        Ok(Self {
            selected: selected.clone(),
            taste_name,
            taste,
            ledger_json: serde_json::to_string_pretty(ledger).context("serialize ledger")?,
            progress: read_optional(&paths.progress_path)?,
            project_memory: read_optional(&paths.project_memory_path)?,
            product: read_optional(&paths.product_path)?,
        })
    }
}

/// Builds the agent prompt within a byte budget, dropping optional context first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &BuildPromptInputs) -> Result<String> {
        let rendered = PromptEngine::new().render(
            "build",
            context! {
                selected => SelectedStoryContext::from_story(&input.selected),
                story_complete => STORY_COMPLETE,
                all_complete => ALL_COMPLETE,
                ledger_file => "prd.json",
                progress_file => "progress.txt",
                taste_name => input.taste_name.as_str(),
                taste => input.taste.trim(),
                ledger => input.ledger_json.trim(),
                progress => non_blank(input.progress.as_deref()),
                memory => non_blank(input.project_memory.as_deref()),
                product => non_blank(input.product.as_deref()),
            },
        )?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

/// User message for translating steering text into ledger and taste updates.
pub fn render_steering_prompt(
    steering: &str,
    ledger_summary: &str,
    taste: &str,
    next_id: &str,
) -> Result<String> {
    PromptEngine::new().render(
        "steer",
        context! {
            steering => steering.trim(),
            ledger_summary => ledger_summary.trim(),
            taste => taste.trim(),
            next_id => next_id,
        },
    )
}

/// User message asking for a priority justification of `story`.
pub fn render_synthesis_prompt(ledger_summary: &str, story: &Story, taste: &str) -> Result<String> {
    PromptEngine::new().render(
        "synthesis",
        context! {
            ledger_summary => ledger_summary.trim(),
            story => SelectedStoryContext::from_story(story),
            taste => taste.trim(),
        },
    )
}

/// Context gathered for a planning call.
#[derive(Debug, Clone, Default)]
pub struct PlanPromptInputs {
    pub ledger_summary: Option<String>,
    pub taste: String,
    pub project_memory: Option<String>,
    pub product: Option<String>,
    pub next_id: String,
}

pub fn render_plan_prompt(input: &PlanPromptInputs) -> Result<String> {
    PromptEngine::new().render(
        "plan",
        context! {
            ledger_summary => non_blank(input.ledger_summary.as_deref()),
            taste => input.taste.trim(),
            memory => non_blank(input.project_memory.as_deref()),
            product => non_blank(input.product.as_deref()),
            next_id => input.next_id.as_str(),
        },
    )
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

/// Read file contents if it exists, returning `None` for missing files.
pub fn read_optional(path: impl Into<PathBuf>) -> Result<Option<String>> {
    let path = path.into();
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("read prompt input {}", path.display()))?;
    Ok(Some(contents))
}
