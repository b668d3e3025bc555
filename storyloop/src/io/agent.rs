//! Agent abstraction and the streaming command-line implementation.
//!
//! The [`Agent`] trait decouples the build loop from the coding-agent
//! backend. [`CommandAgent`] spawns the configured CLI once per story, feeds
//! it the prompt on stdin and decodes its stream-json output while it runs,
//! so the caller can show live status. Tests use scripted agents instead.

use std::error::Error;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::sentinel::{MarkerFilter, reduce};
use crate::core::stream::{LineDecoder, StreamEvent, decode_line, tool_label};
use crate::io::config::AgentConfig;
use crate::io::process::{join_output, read_stream_limited};

const TICK: Duration = Duration::from_secs(1);

/// Pid of the agent currently running, 0 when idle.
static ACTIVE_AGENT_PID: AtomicU32 = AtomicU32::new(0);

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Project root; the agent runs with this as its working directory.
    pub workdir: PathBuf,
    /// Fully rendered build prompt.
    pub prompt: String,
}

/// Live status while an agent runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    /// No record for a while; seconds since the invocation started.
    Working { elapsed_secs: u64 },
    /// A tool invocation started.
    Tool { label: String },
    /// Assistant text with completion markers removed.
    Text { text: String },
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    /// Concatenated assistant text, markers stripped.
    pub text: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub story_complete: bool,
    pub all_complete: bool,
}

impl AgentRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run one invocation to completion. A non-zero exit is reported in
    /// [`AgentRun::exit_code`], not as an error.
    fn invoke(&self, request: &AgentRequest, on_activity: &mut dyn FnMut(Activity))
    -> Result<AgentRun>;
}

/// The agent binary could not be started at all. Retrying will not help.
#[derive(Debug)]
pub struct AgentLaunchError {
    pub program: String,
    pub source: std::io::Error,
}

impl fmt::Display for AgentLaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not launch agent `{}`: {} (install it or set agent.command in .storyloop/config.toml)",
            self.program, self.source
        )
    }
}

impl Error for AgentLaunchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Agent that spawns `agent.command` and reads its stream-json stdout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
}

impl CommandAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(workdir = %request.workdir.display(), prompt_bytes = request.prompt.len()))]
    fn invoke(
        &self,
        request: &AgentRequest,
        on_activity: &mut dyn FnMut(Activity),
    ) -> Result<AgentRun> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Ctrl-C belongs to the loop; the in-flight build keeps running.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        info!(program = %program, "starting agent");
        let mut child = cmd.spawn().map_err(|source| AgentLaunchError {
            program: program.clone(),
            source,
        })?;
        ACTIVE_AGENT_PID.store(child.id(), Ordering::SeqCst);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("agent stdin was not piped"))?;
        let prompt = request.prompt.clone().into_bytes();
        let stdin_handle = thread::spawn(move || -> Result<()> {
            match stdin.write_all(&prompt) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
                Err(err) => Err(err).context("write agent stdin"),
            }
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("agent stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("agent stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        let line_limit = self.config.output_limit_bytes;
        let stdout_handle = thread::spawn(move || -> Result<()> {
            let mut reader = stdout;
            let mut decoder = LineDecoder::new(line_limit);
            let mut chunk = [0u8; 8192];
            loop {
                let n = reader.read(&mut chunk).context("read agent stdout")?;
                if n == 0 {
                    break;
                }
                for line in decoder.push(&chunk[..n]) {
                    for event in decode_line(&line) {
                        if tx.send(event).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            if let Some(line) = decoder.finish() {
                for event in decode_line(&line) {
                    let _ = tx.send(event);
                }
            }
            Ok(())
        });
        let stderr_limit = self.config.output_limit_bytes;
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, stderr_limit));

        let idle_notice = Duration::from_secs(self.config.idle_notice_secs);
        let started = Instant::now();
        let mut last_record = started;
        let mut raw = String::new();
        let mut filter = MarkerFilter::default();
        let mut tools = 0usize;
        loop {
            match rx.recv_timeout(TICK) {
                Ok(event) => {
                    last_record = Instant::now();
                    match event {
                        StreamEvent::Text(fragment) => {
                            raw.push_str(&fragment);
                            let shown = filter.push(&fragment);
                            if !shown.trim().is_empty() {
                                on_activity(Activity::Text { text: shown });
                            }
                        }
                        StreamEvent::ToolStart { name } => {
                            tools += 1;
                            on_activity(Activity::Tool {
                                label: tool_label(&name),
                            });
                        }
                        StreamEvent::ToolEnd => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_record.elapsed() >= idle_notice {
                        on_activity(Activity::Working {
                            elapsed_secs: started.elapsed().as_secs(),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let rest = filter.finish();
        if !rest.trim().is_empty() {
            on_activity(Activity::Text { text: rest });
        }

        let status = child.wait().context("wait for agent");
        ACTIVE_AGENT_PID.store(0, Ordering::SeqCst);
        let status = status?;

        match stdout_handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("agent stdout reader panicked")),
        }
        match stdin_handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("agent stdin writer panicked")),
        }
        let (stderr_bytes, stderr_truncated) =
            join_output(stderr_handle).context("join agent stderr")?;
        if !stderr_bytes.is_empty() {
            debug!(
                stderr = %String::from_utf8_lossy(&stderr_bytes),
                stderr_truncated,
                "agent stderr"
            );
        }

        let reduced = reduce(&raw);
        let exit_code = status.code();
        if exit_code == Some(0) {
            info!(
                elapsed_secs = started.elapsed().as_secs(),
                tools,
                story_complete = reduced.story_complete,
                "agent finished"
            );
        } else {
            warn!(exit_code = ?exit_code, "agent exited unsuccessfully");
        }

        Ok(AgentRun {
            text: reduced.text,
            exit_code,
            story_complete: reduced.story_complete,
            all_complete: reduced.all_complete,
        })
    }
}

/// Terminate the running agent, if any. Used on hard interrupt, where
/// `process::exit` would otherwise orphan it.
pub fn terminate_active_agent() {
    let pid = ACTIVE_AGENT_PID.swap(0, Ordering::SeqCst);
    if pid == 0 {
        return;
    }
    #[cfg(unix)]
    {
        // Negative pid addresses the agent's whole process group.
        match Command::new("kill")
            .arg("-TERM")
            .arg("--")
            .arg(format!("-{pid}"))
            .status()
        {
            Ok(status) if status.success() => debug!(pid, "agent terminated"),
            Ok(status) => warn!(pid, exit_code = ?status.code(), "failed to terminate agent"),
            Err(err) => warn!(pid, err = %err, "failed to run kill"),
        }
    }
    #[cfg(not(unix))]
    warn!(pid, "agent left running");
}
