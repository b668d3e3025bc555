//! Canonical file locations for a project and for the taste profile.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// All files the loop reads or writes inside a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub progress_path: PathBuf,
    pub synthesis_path: PathBuf,
    pub steer_path: PathBuf,
    pub run_marker_path: PathBuf,
    pub config_path: PathBuf,
    pub project_memory_path: PathBuf,
    pub product_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".storyloop");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            ledger_path: root.join("prd.json"),
            progress_path: root.join("progress.txt"),
            synthesis_path: state_dir.join("synthesis.md"),
            steer_path: state_dir.join("steer.md"),
            run_marker_path: state_dir.join("build.pid"),
            config_path: state_dir.join("config.toml"),
            project_memory_path: state_dir.join("project-memory.md"),
            product_path: state_dir.join("product.md"),
        }
    }
}

/// The user's taste profile and the lock file that serializes edits to it.
#[derive(Debug, Clone)]
pub struct TastePaths {
    pub profile_path: PathBuf,
    pub lock_path: PathBuf,
}

impl TastePaths {
    pub fn new(profile_path: impl Into<PathBuf>) -> Self {
        let profile_path = profile_path.into();
        let mut lock_name = profile_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "taste".into());
        lock_name.push(".lock");
        let lock_path = profile_path.with_file_name(lock_name);
        Self {
            profile_path,
            lock_path,
        }
    }

    /// `--taste` flag, then `taste_profile` from config, then `~/.storyloop/taste.md`.
    pub fn resolve(flag: Option<&Path>, configured: Option<&Path>) -> Option<Self> {
        if let Some(path) = flag.or(configured) {
            return Some(Self::new(path));
        }
        dirs::home_dir().map(|home| Self::new(home.join(".storyloop").join("taste.md")))
    }
}

/// A required input file does not exist. Fatal; carries a remediation hint.
#[derive(Debug, Clone)]
pub struct MissingInputError {
    pub what: &'static str,
    pub path: PathBuf,
    pub hint: &'static str,
}

impl fmt::Display for MissingInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing {} at {} ({})",
            self.what,
            self.path.display(),
            self.hint
        )
    }
}

impl Error for MissingInputError {}
