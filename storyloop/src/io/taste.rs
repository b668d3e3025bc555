//! Taste profile access and its advisory lock.
//!
//! The profile is one file shared by every project and every concurrent
//! invocation. Appends go through a create-if-absent lock file so two
//! steering runs never interleave their writes. A lock that stays taken for
//! the whole retry window is assumed stale and overridden.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::io::config::LockConfig;
use crate::io::paths::{MissingInputError, TastePaths};

/// Read the whole profile. Missing file is a [`MissingInputError`].
pub fn read_taste_profile(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(MissingInputError {
            what: "taste profile",
            path: path.to_path_buf(),
            hint: "create it, or pass --taste / set taste_profile in .storyloop/config.toml",
        }
        .into());
    }
    fs::read_to_string(path).with_context(|| format!("read taste profile {}", path.display()))
}

/// Held lock file; dropping it releases the lock.
#[derive(Debug)]
pub struct TasteLock {
    path: PathBuf,
    overridden: bool,
}

impl TasteLock {
    pub fn acquire(path: &Path, config: &LockConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        for attempt in 1..=config.attempts {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write_pid(&mut file, path)?;
                    debug!(path = %path.display(), attempt, "taste lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        overridden: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if attempt < config.attempts {
                        let wait = Duration::from_millis(config.backoff_ms * u64::from(attempt));
                        debug!(attempt, wait_ms = wait.as_millis() as u64, "taste lock busy");
                        thread::sleep(wait);
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create taste lock {}", path.display()));
                }
            }
        }

        warn!(
            path = %path.display(),
            attempts = config.attempts,
            "taste lock still held, treating it as stale"
        );
        let mut file = fs::File::create(path)
            .with_context(|| format!("override taste lock {}", path.display()))?;
        write_pid(&mut file, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            overridden: true,
        })
    }

    /// True if the lock was taken over from a presumed-stale holder.
    pub fn overridden(&self) -> bool {
        self.overridden
    }
}

impl Drop for TasteLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(err = %err, path = %self.path.display(), "failed to release taste lock");
        }
    }
}

fn write_pid(file: &mut fs::File, path: &Path) -> Result<()> {
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("write taste lock {}", path.display()))
}

/// Append `block` to the profile under the lock, re-reading the current text first.
pub fn append_to_taste_profile(taste: &TastePaths, block: &str, config: &LockConfig) -> Result<()> {
    let _lock = TasteLock::acquire(&taste.lock_path, config)?;

    let current = match fs::read_to_string(&taste.profile_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("read taste profile {}", taste.profile_path.display())
            });
        }
    };

    let mut updated = current.trim_end().to_string();
    if !updated.is_empty() {
        updated.push_str("\n\n");
    }
    updated.push_str(block.trim());
    updated.push('\n');

    fs::write(&taste.profile_path, updated)
        .with_context(|| format!("write taste profile {}", taste.profile_path.display()))?;
    info!(path = %taste.profile_path.display(), bytes = block.len(), "taste profile updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;

    fn fast_lock() -> LockConfig {
        LockConfig {
            attempts: 3,
            backoff_ms: 1,
        }
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taste.md.lock");

        let lock = TasteLock::acquire(&path, &fast_lock()).expect("acquire");
        assert!(path.exists());
        assert!(!lock.overridden());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_is_overridden_after_retries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taste.md.lock");
        fs::write(&path, "12345\n").expect("stale lock");

        let lock = TasteLock::acquire(&path, &fast_lock()).expect("acquire");
        assert!(lock.overridden());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn append_separates_blocks_with_blank_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let taste = TastePaths::new(temp.path().join("taste.md"));
        fs::write(&taste.profile_path, "# Taste\n\nPrefers small diffs.\n").expect("seed");

        append_to_taste_profile(&taste, "Likes dark UIs.", &fast_lock()).expect("append");

        let contents = fs::read_to_string(&taste.profile_path).expect("read");
        assert_eq!(contents, "# Taste\n\nPrefers small diffs.\n\nLikes dark UIs.\n");
        assert!(!taste.lock_path.exists());
    }

    #[test]
    fn append_creates_missing_profile() {
        let temp = tempfile::tempdir().expect("tempdir");
        let taste = TastePaths::new(temp.path().join("nested/taste.md"));
        fs::create_dir_all(temp.path().join("nested")).expect("dir");

        append_to_taste_profile(&taste, "First note", &fast_lock()).expect("append");
        assert_eq!(
            fs::read_to_string(&taste.profile_path).expect("read"),
            "First note\n"
        );
    }

    #[test]
    fn concurrent_appends_do_not_lose_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let taste = TastePaths::new(temp.path().join("taste.md"));
        fs::write(&taste.profile_path, "base\n").expect("seed");
        let config = LockConfig {
            attempts: 200,
            backoff_ms: 1,
        };

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let taste = taste.clone();
                let config = config.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    append_to_taste_profile(&taste, &format!("note {i}"), &config)
                        .expect("append");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let contents = fs::read_to_string(&taste.profile_path).expect("read");
        for i in 0..4 {
            assert!(contents.contains(&format!("note {i}")), "lost note {i}");
        }
    }

    #[test]
    fn missing_profile_is_a_missing_input_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_taste_profile(&temp.path().join("taste.md")).unwrap_err();
        assert!(err.downcast_ref::<MissingInputError>().is_some());
    }
}
