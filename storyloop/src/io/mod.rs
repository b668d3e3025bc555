//! Side-effecting helpers: files, child processes, signals.

pub mod agent;
pub mod config;
pub mod interrupt;
pub mod ledger_store;
pub mod llm;
pub mod logs;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod run_marker;
pub mod taste;
