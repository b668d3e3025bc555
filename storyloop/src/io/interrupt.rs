//! User interrupt tracking.
//!
//! The first Ctrl-C asks the loop to stop after the story in flight; the
//! second exits immediately with [`HARD_INTERRUPT`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

use crate::exit_codes::HARD_INTERRUPT;
use crate::io::agent::terminate_active_agent;
use crate::io::run_marker::remove_marker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    /// Finish the current story, then stop.
    Graceful,
    /// Stop now.
    Hard,
}

/// Shared interrupt counter. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    count: Arc<AtomicUsize>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one interrupt request and report how far it escalated.
    pub fn request(&self) -> InterruptLevel {
        match self.count.fetch_add(1, Ordering::SeqCst) {
            0 => InterruptLevel::Graceful,
            _ => InterruptLevel::Hard,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }
}

/// Route SIGINT into `interrupt`.
///
/// On the second request the agent is terminated, the run marker removed,
/// `on_hard_exit` called, and the process exits; destructors do not run on
/// that path.
pub fn install_ctrlc<F>(interrupt: Interrupt, marker_path: PathBuf, on_hard_exit: F) -> Result<()>
where
    F: Fn() + Send + 'static,
{
    ctrlc::set_handler(move || match interrupt.request() {
        InterruptLevel::Graceful => {
            eprintln!(
                "\nStopping after the current story finishes. Press Ctrl-C again to exit now."
            );
        }
        InterruptLevel::Hard => {
            warn!("second interrupt, exiting immediately");
            terminate_active_agent();
            remove_marker(&marker_path);
            on_hard_exit();
            std::process::exit(HARD_INTERRUPT);
        }
    })
    .context("install Ctrl-C handler")
}
