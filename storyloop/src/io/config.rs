//! Loop configuration stored under `.storyloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that
/// work with the `claude` CLI on `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopSettings {
    /// Byte budget for the build prompt before optional sections are dropped.
    pub prompt_budget_bytes: usize,

    /// Taste profile location; falls back to `~/.storyloop/taste.md`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taste_profile: Option<PathBuf>,

    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line. The prompt is written to its stdin.
    pub command: Vec<String>,
    /// Seconds without a stream record before the "working" indicator shows.
    pub idle_notice_secs: u64,
    /// Upper bound for a single stream line and for captured stderr.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// One-shot model command line. The user message is written to its stdin.
    pub command: Vec<String>,
    /// Flag that precedes the system prompt argument.
    pub system_prompt_flag: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before each retry of a failed build; its length bounds the retries.
    pub backoff_secs: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Attempts to take the taste-profile lock before treating it as stale.
    pub attempts: u32,
    /// Linear backoff step between attempts.
    pub backoff_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .map(String::from)
            .to_vec(),
            idle_notice_secs: 5,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--output-format", "text"]
                .map(String::from)
                .to_vec(),
            system_prompt_flag: "--system-prompt".to_string(),
            timeout_secs: 5 * 60,
            max_attempts: 2,
            retry_backoff_secs: 5,
            output_limit_bytes: 200_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_secs: vec![10, 30],
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff_ms: 200,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            prompt_budget_bytes: 200_000,
            taste_profile: None,
            agent: AgentConfig::default(),
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

impl LoopSettings {
    pub fn validate(&self) -> Result<()> {
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.idle_notice_secs == 0 {
            return Err(anyhow!("agent.idle_notice_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.llm.command.is_empty() || self.llm.command[0].trim().is_empty() {
            return Err(anyhow!("llm.command must be a non-empty array"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if self.llm.max_attempts == 0 {
            return Err(anyhow!("llm.max_attempts must be > 0"));
        }
        if self.llm.output_limit_bytes == 0 {
            return Err(anyhow!("llm.output_limit_bytes must be > 0"));
        }
        if self.lock.attempts == 0 {
            return Err(anyhow!("lock.attempts must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopSettings::default()`.
pub fn load_settings(path: &Path) -> Result<LoopSettings> {
    if !path.exists() {
        let cfg = LoopSettings::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopSettings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    Ok(cfg)
}
