//! Autonomous story build loop.
//!
//! Reads the story ledger (`prd.json`) in the project directory, hands one
//! not-done story at a time to a coding agent, and keeps going until a quota,
//! deadline, interrupt, or an empty backlog stops it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use storyloop::core::budget::format_elapsed;
use storyloop::exit_codes::{COMPLETE, INVALID, OK};
use storyloop::io::agent::{Activity, CommandAgent};
use storyloop::io::config::{LoopSettings, load_settings};
use storyloop::io::interrupt::{Interrupt, install_ctrlc};
use storyloop::io::llm::CommandLlm;
use storyloop::io::paths::{ProjectPaths, TastePaths};
use storyloop::logging;
use storyloop::looping::{
    Collaborators, LoopConfig, LoopEvent, LoopOutcome, StopReason, ThreadSleeper, run_loop,
};
use storyloop::plan::{LlmPlanner, Planner};
use storyloop::status::status_report;
use storyloop::steer::{SteeringOutcome, queue_steering};

#[derive(Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Autonomous build loop that feeds user stories to a coding agent"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(short = 'C', long = "dir", global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build not-done stories from prd.json, one agent run each.
    Build {
        /// Stop after this many stories were built.
        #[arg(short = 'n', long)]
        max_items: Option<u32>,
        /// Plan more stories whenever the ledger runs out.
        #[arg(long = "loop")]
        loop_mode: bool,
        /// Do not start new work after this many minutes.
        #[arg(long)]
        max_minutes: Option<u64>,
        /// Taste profile path (overrides config and ~/.storyloop/taste.md).
        #[arg(long)]
        taste: Option<PathBuf>,
    },
    /// Ask the planner for the next batch of stories.
    Plan {
        /// Taste profile path (overrides config and ~/.storyloop/taste.md).
        #[arg(long)]
        taste: Option<PathBuf>,
    },
    /// Queue guidance for the build loop; applied at the start of the next cycle.
    Steer {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Show ledger progress and the next story.
    Status,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let paths = ProjectPaths::new(root);
    let settings = load_settings(&paths.config_path)?;

    match cli.command {
        Command::Build {
            max_items,
            loop_mode,
            max_minutes,
            taste,
        } => {
            let config = LoopConfig {
                max_items,
                loop_mode,
                deadline: max_minutes.map(|minutes| Duration::from_secs(minutes * 60)),
                ..LoopConfig::from_settings(&settings)
            };
            let taste = resolve_taste(taste, &settings)?;
            cmd_build(&paths, &taste, &settings, &config)
        }
        Command::Plan { taste } => {
            let taste = resolve_taste(taste, &settings)?;
            cmd_plan(&paths, &taste, &settings)
        }
        Command::Steer { text } => cmd_steer(&paths, &text.join(" ")),
        Command::Status => cmd_status(&paths),
    }
}

fn resolve_taste(flag: Option<PathBuf>, settings: &LoopSettings) -> Result<TastePaths> {
    TastePaths::resolve(flag.as_deref(), settings.taste_profile.as_deref())
        .ok_or_else(|| anyhow!("cannot locate home directory for the taste profile; pass --taste"))
}

fn cmd_build(
    paths: &ProjectPaths,
    taste: &TastePaths,
    settings: &LoopSettings,
    config: &LoopConfig,
) -> Result<i32> {
    let interrupt = Interrupt::new();
    let tally = Arc::new(RunTally::new());
    let handler_tally = Arc::clone(&tally);
    install_ctrlc(interrupt.clone(), paths.run_marker_path.clone(), move || {
        println!();
        for line in handler_tally.hard_exit_summary() {
            println!("{line}");
        }
    })?;

    let agent = CommandAgent::new(settings.agent.clone());
    let llm = CommandLlm::new(settings.llm.clone());
    let planner = LlmPlanner::new(CommandLlm::new(settings.llm.clone()), taste.clone());
    let collaborators = Collaborators {
        agent: &agent,
        llm: &llm,
        planner: &planner,
        sleeper: &ThreadSleeper,
        interrupt: &interrupt,
    };

    let mut narrator = Narrator::default();
    let outcome = run_loop(paths, taste, config, &collaborators, &mut |event| {
        tally.record(&event);
        narrator.event(event);
    });
    narrator.end_status_line();
    let outcome = outcome?;
    print_summary(&outcome);
    Ok(OK)
}

fn cmd_plan(paths: &ProjectPaths, taste: &TastePaths, settings: &LoopSettings) -> Result<i32> {
    let planner = LlmPlanner::new(CommandLlm::new(settings.llm.clone()), taste.clone());
    let added = planner.plan(&paths.root)?;
    if added.is_empty() {
        println!("Planner had nothing new to add.");
    }
    for story in &added {
        println!("{}  {}", story.id, story.title);
    }
    Ok(OK)
}

fn cmd_steer(paths: &ProjectPaths, text: &str) -> Result<i32> {
    if text.trim().is_empty() {
        bail!("steering text is empty");
    }
    if queue_steering(paths, text)? {
        println!("Queued. The running build applies it at the start of its next cycle.");
    } else {
        println!("Queued. It applies when `storyloop build` next runs.");
    }
    Ok(OK)
}

fn cmd_status(paths: &ProjectPaths) -> Result<i32> {
    let report = status_report(paths)?;
    println!(
        "{}: {}/{} stories done",
        report.project, report.done, report.total
    );
    for story in &report.remaining {
        println!("  {}  [{}]  {}", story.id, story.status.as_str(), story.title);
    }
    if let Some(pid) = report.active_pid {
        println!("Build running (pid {pid}).");
    }
    if report.steering_queued {
        println!("Steering queued.");
    }
    match report.next {
        Some(story) => {
            println!("Next: {} {}", story.id, story.title);
            Ok(OK)
        }
        None => {
            println!("Nothing left to build. Run `storyloop plan` for more.");
            Ok(COMPLETE)
        }
    }
}

/// Prints loop events. The "working" indicator rewrites one stderr line.
#[derive(Default)]
struct Narrator {
    status_line: bool,
}

impl Narrator {
    fn event(&mut self, event: LoopEvent) {
        if let LoopEvent::Activity(Activity::Working { elapsed_secs }) = event {
            eprint!("\r  working... {}", format_elapsed(Duration::from_secs(elapsed_secs)));
            let _ = std::io::stderr().flush();
            self.status_line = true;
            return;
        }
        self.end_status_line();

        match event {
            LoopEvent::Steering(SteeringOutcome::Applied {
                added_ids,
                taste_updated,
            }) => {
                if added_ids.is_empty() {
                    println!("Steering applied: no new stories.");
                } else {
                    println!("Steering applied: added {}.", added_ids.join(", "));
                }
                if taste_updated {
                    println!("Taste profile updated.");
                }
            }
            LoopEvent::Steering(SteeringOutcome::ModelFailed(message)) => {
                println!("Steering postponed, model call failed: {message}");
            }
            LoopEvent::Steering(SteeringOutcome::Malformed(message)) => {
                println!("Steering discarded, reply was unusable: {message}");
            }
            LoopEvent::Steering(SteeringOutcome::NoInput) => {}
            LoopEvent::Selected { id, title } => println!("\n==> {id}: {title}"),
            LoopEvent::AttemptStarted {
                attempt,
                max_attempts,
                ..
            } => {
                if attempt > 1 {
                    println!("  attempt {attempt}/{max_attempts}");
                }
            }
            LoopEvent::Activity(Activity::Tool { label }) => println!("  - {label}"),
            LoopEvent::Activity(Activity::Text { text }) => {
                let text = text.trim();
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            LoopEvent::Activity(Activity::Working { .. }) => {}
            LoopEvent::AttemptFailed {
                attempt,
                exit_code,
                retry_in,
                ..
            } => {
                let exit = exit_code.map_or("no exit code".to_string(), |c| format!("exit {c}"));
                match retry_in {
                    Some(delay) => println!(
                        "  attempt {attempt} failed ({exit}), retrying in {}",
                        format_elapsed(delay)
                    ),
                    None => println!("  attempt {attempt} failed ({exit})"),
                }
            }
            LoopEvent::Built { id } => println!("  built {id}"),
            LoopEvent::Skipped { id, attempts } => {
                println!("  skipped {id} after {attempts} attempts, see progress.txt");
            }
            LoopEvent::Planning => println!("\nPlanning the next stories..."),
            LoopEvent::Planned { added } => println!("Planned {}.", added.join(", ")),
            LoopEvent::LedgerCorrected { messages } => {
                for message in messages {
                    println!("  ledger corrected: {message}");
                }
            }
        }
    }

    fn end_status_line(&mut self) {
        if self.status_line {
            eprintln!();
            self.status_line = false;
        }
    }
}

/// Counters mirrored from loop events, readable from the Ctrl-C handler.
struct RunTally {
    started: Instant,
    built: AtomicU32,
    cycles: AtomicU32,
    skipped: Mutex<Vec<String>>,
}

impl RunTally {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            built: AtomicU32::new(0),
            cycles: AtomicU32::new(1),
            skipped: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, event: &LoopEvent) {
        match event {
            LoopEvent::Built { .. } => {
                self.built.fetch_add(1, Ordering::SeqCst);
            }
            LoopEvent::Planned { .. } => {
                self.cycles.fetch_add(1, Ordering::SeqCst);
            }
            LoopEvent::Skipped { id, .. } => self
                .skipped
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id.clone()),
            _ => {}
        }
    }

    fn hard_exit_summary(&self) -> Vec<String> {
        let skipped = self
            .skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        summary_lines(
            "hard interrupt",
            self.built.load(Ordering::SeqCst),
            self.cycles.load(Ordering::SeqCst),
            self.started.elapsed(),
            &skipped,
            "storyloop build",
        )
    }
}

fn print_summary(outcome: &LoopOutcome) {
    println!();
    let lines = summary_lines(
        outcome.stop.as_str(),
        outcome.built,
        outcome.cycles,
        outcome.elapsed,
        &outcome.skipped,
        suggested_next(outcome.stop),
    );
    for line in lines {
        println!("{line}");
    }
}

fn summary_lines(
    stop: &str,
    built: u32,
    cycles: u32,
    elapsed: Duration,
    skipped: &[String],
    next: &str,
) -> Vec<String> {
    let mut lines = vec![
        format!("Stopped: {stop}"),
        format!("  built:   {built}"),
        format!("  cycles:  {cycles}"),
        format!("  elapsed: {}", format_elapsed(elapsed)),
    ];
    if !skipped.is_empty() {
        lines.push(format!("  skipped: {}", skipped.join(", ")));
    }
    lines.push(format!("Next: {next}"));
    lines
}

fn suggested_next(stop: StopReason) -> &'static str {
    match stop {
        StopReason::Complete => "storyloop build --loop",
        StopReason::Exhausted => "storyloop plan",
        StopReason::Quota | StopReason::Deadline | StopReason::Interrupted => "storyloop build",
    }
}
