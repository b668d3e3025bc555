//! Append-only narrative logs: `progress.txt` and `.storyloop/synthesis.md`.
//!
//! The agent writes its own progress notes; the loop only appends failure
//! notes there. Entries are separated by a blank line and never rewritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

use crate::core::types::Story;

/// Current UTC time in RFC 3339 with second precision (`2026-10-18T09:30:00Z`).
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Append a note recording that `story` was given up on after `attempts` builds.
pub fn append_failure_note(
    path: &Path,
    story: &Story,
    attempts: u32,
    last_exit: Option<i32>,
    at: &str,
) -> Result<()> {
    let exit = match last_exit {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    };
    let entry = format!(
        "## {at} {id} skipped by storyloop\nBuild of \"{title}\" failed after {attempts} attempts (last: {exit}). The story is still open.",
        id = story.id,
        title = story.title,
    );
    append_entry(path, &entry)
}

/// Append the priority justification written before building `story`.
pub fn append_synthesis(path: &Path, story: &Story, paragraph: &str, at: &str) -> Result<()> {
    let entry = format!(
        "## {at} {id}: {title}\n\n{body}",
        id = story.id,
        title = story.title,
        body = paragraph.trim()
    );
    append_entry(path, &entry)
}

fn append_entry(path: &Path, entry: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let needs_gap = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let separator = if needs_gap { "\n" } else { "" };
    writeln!(file, "{separator}{}", entry.trim_end())
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}
