//! Run marker: a pid file that says "a build loop is active here".
//!
//! Advisory only. `storyloop steer` reads it to tell the user whether queued
//! guidance will be picked up by a running loop.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Guard that owns the marker file; dropping it removes the file.
#[derive(Debug)]
pub struct RunMarker {
    path: PathBuf,
}

impl RunMarker {
    /// Write the current process id to `path`, replacing a stale marker.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_marker_pid(path) {
            warn!(
                stale_pid = pid,
                path = %path.display(),
                "replacing existing run marker"
            );
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("write run marker {}", path.display()))?;
        debug!(path = %path.display(), "run marker written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunMarker {
    fn drop(&mut self) {
        remove_marker(&self.path);
    }
}

/// Best-effort removal, also used by the hard-interrupt path where destructors do not run.
pub fn remove_marker(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "run marker removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(err = %err, path = %path.display(), "failed to remove run marker"),
    }
}

pub fn is_build_active(path: &Path) -> bool {
    path.exists()
}

/// Pid recorded in the marker, for diagnostics.
pub fn read_marker_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
