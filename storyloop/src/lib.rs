//! Autonomous build loop around a coding agent.
//!
//! A ledger of user stories (`prd.json`) drives the loop: pick the next
//! not-done story, hand it to an agent process, watch its streamed output for
//! a completion marker, persist, repeat. In loop mode an empty ledger is
//! refilled by the planner until it has nothing left to add. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (ids, selection, invariants,
//!   stream decoding, response parsing). No I/O.
//! - **[`io`]**: Side-effecting operations (files, child processes, signals).
//!   Behind traits where tests substitute scripted versions.
//!
//! Orchestration modules ([`looping`], [`steer`], [`plan`], [`synthesis`],
//! [`status`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod plan;
pub mod status;
pub mod steer;
pub mod synthesis;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
