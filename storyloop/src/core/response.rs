//! Parsing of structured model responses (steering and planning).
//!
//! Models are asked for bare JSON but sometimes wrap it in a Markdown code
//! fence anyway. Responses are unwrapped, checked against an embedded JSON
//! Schema, then deserialized. Any failure means "no actionable result".

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::{Story, StoryStatus};

const STEERING_SCHEMA: &str = include_str!("../../schemas/steering_response.schema.json");
const PLAN_SCHEMA: &str = include_str!("../../schemas/plan_response.schema.json");

/// A story as proposed by a model. Ids and status are assigned locally.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedStory {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub why_now: Option<String>,
}

impl ProposedStory {
    /// Materialize as an `open` ledger story under the given id.
    pub fn into_story(self, id: String) -> Story {
        Story {
            id,
            title: self.title.trim().to_string(),
            description: self.description,
            acceptance_criteria: self.acceptance_criteria,
            status: StoryStatus::Open,
            completed_at: None,
            why_now: self
                .why_now
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }
}

/// `{ newStories, twinAppend }` returned for a steering request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteeringResponse {
    pub new_stories: Vec<ProposedStory>,
    #[serde(default)]
    pub twin_append: Option<String>,
}

/// `{ project, description, stories }` returned by the planner call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub stories: Vec<ProposedStory>,
}

/// Remove a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````), if any.
pub fn strip_code_fences(raw: &str) -> &str {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?[ \t]*```\s*$")
            .expect("fence regex should compile")
    });

    match FENCE_RE.captures(raw).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

pub fn parse_steering_response(raw: &str) -> Result<SteeringResponse> {
    let mut response: SteeringResponse = parse_validated(raw, STEERING_SCHEMA)?;
    if response
        .twin_append
        .as_deref()
        .is_some_and(|block| block.trim().is_empty())
    {
        response.twin_append = None;
    }
    Ok(response)
}

pub fn parse_plan_response(raw: &str) -> Result<PlanResponse> {
    parse_validated(raw, PLAN_SCHEMA)
}

fn parse_validated<T: DeserializeOwned>(raw: &str, schema: &str) -> Result<T> {
    let body = strip_code_fences(raw);
    let instance: Value = serde_json::from_str(body).context("parse model response as json")?;
    let schema_value: Value = serde_json::from_str(schema).context("parse embedded schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "model response failed schema validation: {}",
            messages.join("; ")
        ));
    }
    serde_json::from_value(instance).context("deserialize model response")
}
