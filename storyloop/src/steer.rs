//! Steering intake: guidance the user queues in `.storyloop/steer.md`.
//!
//! `storyloop steer` appends to the file at any time. The build loop consumes
//! it once per cycle, before selecting a story, by asking the model to turn
//! it into new stories and an optional taste-profile note.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::ids::IdAllocator;
use crate::core::response::parse_steering_response;
use crate::io::config::LockConfig;
use crate::io::ledger_store::{load_ledger, write_ledger};
use crate::io::llm::Llm;
use crate::io::paths::{ProjectPaths, TastePaths};
use crate::io::prompt::{STEER_SYSTEM, render_steering_prompt};
use crate::io::run_marker::{is_build_active, read_marker_pid};
use crate::io::taste::{append_to_taste_profile, read_taste_profile};

/// What one steering pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteeringOutcome {
    /// Nothing was queued.
    NoInput,
    /// The model call failed; the queued text is kept for the next cycle.
    ModelFailed(String),
    /// The reply was unusable; the queued text was discarded.
    Malformed(String),
    Applied {
        added_ids: Vec<String>,
        taste_updated: bool,
    },
}

/// Consume queued steering text, if any.
pub fn apply_steering<L: Llm + ?Sized>(
    paths: &ProjectPaths,
    taste: &TastePaths,
    llm: &L,
    lock: &LockConfig,
) -> Result<SteeringOutcome> {
    let Some(steering) = read_steering(&paths.steer_path)? else {
        return Ok(SteeringOutcome::NoInput);
    };
    if steering.trim().is_empty() {
        clear_consumed(&paths.steer_path, &steering)?;
        return Ok(SteeringOutcome::NoInput);
    }

    let ledger = load_ledger(&paths.ledger_path)?;
    let taste_text = read_taste_profile(&taste.profile_path)?;
    let next_id = IdAllocator::for_ledger(&ledger).peek();
    let prompt = render_steering_prompt(&steering, &ledger.summary_lines(), &taste_text, &next_id)?;

    let raw = match llm.call(STEER_SYSTEM, &prompt) {
        Ok(raw) => raw,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(err = %message, "steering model call failed, keeping steering file");
            return Ok(SteeringOutcome::ModelFailed(message));
        }
    };

    let response = match parse_steering_response(&raw) {
        Ok(response) => response,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(err = %message, "steering reply unusable, discarding steering file");
            clear_consumed(&paths.steer_path, &steering)?;
            return Ok(SteeringOutcome::Malformed(message));
        }
    };

    // Fresh read: the model call can take a while.
    let mut ledger = load_ledger(&paths.ledger_path)?;
    let mut allocator = IdAllocator::for_ledger(&ledger);
    let mut added_ids = Vec::new();
    for proposed in response.new_stories {
        let story = proposed.into_story(allocator.allocate());
        added_ids.push(story.id.clone());
        ledger.stories.push(story);
    }
    if !added_ids.is_empty() {
        allocator.record(&mut ledger);
        write_ledger(&paths.ledger_path, &ledger)?;
        info!(added = ?added_ids, "steering added stories");
    }

    // Stories are persisted, so the steering text counts as consumed from here on.
    let taste_updated = match response.twin_append.as_deref() {
        Some(block) => match append_to_taste_profile(taste, block, lock) {
            Ok(()) => true,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "taste profile not updated");
                false
            }
        },
        None => false,
    };

    clear_consumed(&paths.steer_path, &steering)?;
    Ok(SteeringOutcome::Applied {
        added_ids,
        taste_updated,
    })
}

/// Queue guidance for the next cycle. Returns true if a build loop is running.
pub fn queue_steering(paths: &ProjectPaths, text: &str) -> Result<bool> {
    let current = read_steering(&paths.steer_path)?.unwrap_or_default();
    let mut updated = current.trim_end().to_string();
    if !updated.is_empty() {
        updated.push_str("\n\n");
    }
    updated.push_str(text.trim());
    updated.push('\n');

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    fs::write(&paths.steer_path, updated)
        .with_context(|| format!("write steering file {}", paths.steer_path.display()))?;

    let active = is_build_active(&paths.run_marker_path);
    debug!(active, pid = ?read_marker_pid(&paths.run_marker_path), "steering queued");
    Ok(active)
}

fn read_steering(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read steering file {}", path.display())),
    }
}

/// Empty the steering file, keeping anything appended after `consumed` was read.
fn clear_consumed(path: &Path, consumed: &str) -> Result<()> {
    let current = read_steering(path)?.unwrap_or_default();
    let remainder = current
        .strip_prefix(consumed)
        .map(str::trim_start)
        .unwrap_or_default();
    if !remainder.is_empty() {
        debug!(bytes = remainder.len(), "keeping steering queued during the model call");
    }
    fs::write(path, remainder)
        .with_context(|| format!("clear steering file {}", path.display()))
}
