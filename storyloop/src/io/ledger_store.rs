//! Ledger load/save helpers with invariant validation.
//!
//! Every load reads the file fresh: the agent process edits `prd.json`
//! out-of-band, so nothing here caches across cycles. There is no lock on
//! the ledger; writers are kept apart by the cycle order.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::invariants::{ledger_warnings, validate_ledger};
use crate::core::types::Ledger;
use crate::io::paths::MissingInputError;

/// Load and validate the ledger. A missing file is a [`MissingInputError`].
pub fn load_ledger(path: &Path) -> Result<Ledger> {
    if !path.exists() {
        return Err(MissingInputError {
            what: "ledger",
            path: path.to_path_buf(),
            hint: "run `storyloop plan` first",
        }
        .into());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    let ledger: Ledger = serde_json::from_str(&contents)
        .with_context(|| format!("parse ledger {}", path.display()))?;

    let errors = validate_ledger(&ledger);
    if !errors.is_empty() {
        return Err(anyhow!(
            "ledger invariants failed for {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    for warning in ledger_warnings(&ledger) {
        warn!(ledger = %path.display(), "{warning}");
    }

    debug!(stories = ledger.stories.len(), "ledger loaded");
    Ok(ledger)
}

pub fn load_ledger_if_exists(path: &Path) -> Result<Option<Ledger>> {
    if !path.exists() {
        return Ok(None);
    }
    load_ledger(path).map(Some)
}

/// Write the full ledger, pretty-printed, via temp file + rename.
pub fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    debug!(path = %path.display(), stories = ledger.stories.len(), "writing ledger");
    let mut buf = serde_json::to_string_pretty(ledger).context("serialize ledger")?;
    buf.push('\n');

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}
