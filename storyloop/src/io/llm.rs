//! One-shot language model calls (steering, synthesis, planning).

use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::config::LlmConfig;
use crate::io::process::run_command_with_timeout;

/// A model that answers one system + user message pair with text.
pub trait Llm {
    fn call(&self, system: &str, user: &str) -> Result<String>;
}

/// Model reached through a command-line client.
///
/// The system prompt is passed after `llm.system_prompt_flag`; the user
/// message goes to stdin. Non-zero exit, timeout, or empty output all count
/// as a failed attempt.
#[derive(Debug, Clone)]
pub struct CommandLlm {
    config: LlmConfig,
}

impl CommandLlm {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    fn attempt(&self, system: &str, user: &str) -> Result<String> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("llm.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if !self.config.system_prompt_flag.is_empty() {
            cmd.arg(&self.config.system_prompt_flag).arg(system);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(user.as_bytes()),
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        )?;

        if output.timed_out {
            return Err(anyhow!(
                "model call timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "model call exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(200)
            ));
        }
        let text = output.stdout_text();
        if text.trim().is_empty() {
            return Err(anyhow!("model returned empty output"));
        }
        Ok(text)
    }
}

impl Llm for CommandLlm {
    #[instrument(skip_all, fields(system_bytes = system.len(), user_bytes = user.len()))]
    fn call(&self, system: &str, user: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_attempts {
            match self.attempt(system, user) {
                Ok(text) => {
                    debug!(attempt, bytes = text.len(), "model call succeeded");
                    return Ok(text);
                }
                Err(err) => {
                    warn!(attempt, err = %format!("{err:#}"), "model call failed");
                    last_err = Some(err);
                    if attempt < self.config.max_attempts {
                        thread::sleep(Duration::from_secs(self.config.retry_backoff_secs));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("model call was never attempted")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_llm(script: &str, max_attempts: u32) -> CommandLlm {
        CommandLlm::new(LlmConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
            ],
            system_prompt_flag: "--system".to_string(),
            timeout_secs: 10,
            max_attempts,
            retry_backoff_secs: 0,
            output_limit_bytes: 4096,
        })
    }

    #[test]
    fn passes_system_flag_and_user_stdin() {
        // $1 is the flag, $2 the system prompt; stdin carries the user message.
        let llm = sh_llm(r#"printf '%s|%s|' "$1" "$2"; cat"#, 1);
        let text = llm.call("be brief", "hello").expect("call");
        assert_eq!(text, "--system|be brief|hello");
    }

    #[test]
    fn empty_output_is_an_error() {
        let llm = sh_llm("cat > /dev/null", 1);
        let err = llm.call("s", "u").unwrap_err();
        assert!(err.to_string().contains("empty output"));
    }

    #[test]
    fn retries_after_a_failed_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("seen");
        let script = format!(
            "cat > /dev/null; if [ -f '{0}' ]; then echo ok; else touch '{0}'; exit 1; fi",
            marker.display()
        );
        let llm = sh_llm(&script, 2);
        assert_eq!(llm.call("s", "u").expect("call").trim(), "ok");
    }

    #[test]
    fn exhausted_attempts_return_last_error() {
        let llm = sh_llm("cat > /dev/null; echo 'overloaded' >&2; exit 2", 2);
        let err = llm.call("s", "u").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("status Some(2)"));
        assert!(message.contains("overloaded"));
    }
}
