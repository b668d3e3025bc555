//! CLI tests for the storyloop binary.
//!
//! Spawns the binary against temporary projects and checks exit codes and
//! the files each command leaves behind.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use storyloop::exit_codes;
use storyloop::io::ledger_store::write_ledger;
use storyloop::io::paths::ProjectPaths;
use storyloop::test_support::{TASTE_TEXT, done_story, ledger_with, open_story};

fn storyloop(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_storyloop"))
        .arg("-C")
        .arg(root)
        .args(args)
        .env("HOME", root.join("home"))
        .env_remove("RUST_LOG")
        .output()
        .expect("run storyloop")
}

fn project_with(stories: Vec<storyloop::core::types::Story>) -> (tempfile::TempDir, ProjectPaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = ProjectPaths::new(temp.path());
    write_ledger(&paths.ledger_path, &ledger_with(stories)).expect("write ledger");
    let taste_dir = temp.path().join("home/.storyloop");
    fs::create_dir_all(&taste_dir).expect("taste dir");
    fs::write(taste_dir.join("taste.md"), TASTE_TEXT).expect("write taste");
    (temp, paths)
}

#[test]
fn status_on_finished_ledger_exits_with_complete_code() {
    let (temp, _) = project_with(vec![done_story("US-001"), done_story("US-002")]);

    let output = storyloop(temp.path(), &["status"]);

    assert_eq!(output.status.code(), Some(exit_codes::COMPLETE));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2/2 stories done"), "{stdout}");
}

#[test]
fn status_with_open_story_names_next() {
    let (temp, _) = project_with(vec![done_story("US-001"), open_story("US-002")]);

    let output = storyloop(temp.path(), &["status"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Next: US-002"), "{stdout}");
}

#[test]
fn steer_queues_text_for_next_cycle() {
    let (temp, paths) = project_with(vec![open_story("US-001")]);

    let output = storyloop(temp.path(), &["steer", "add", "dark", "mode"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let queued = fs::read_to_string(&paths.steer_path).expect("steer file");
    assert!(queued.contains("add dark mode"), "{queued}");
}

#[test]
fn build_without_ledger_points_at_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let taste_dir = temp.path().join("home/.storyloop");
    fs::create_dir_all(&taste_dir).expect("taste dir");
    fs::write(taste_dir.join("taste.md"), TASTE_TEXT).expect("write taste");

    let output = storyloop(temp.path(), &["build"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("storyloop plan"), "{stderr}");
    assert!(!temp.path().join(".storyloop/build.pid").exists());
}

#[test]
fn build_with_unlaunchable_agent_fails_fast() {
    let (temp, paths) = project_with(vec![open_story("US-001")]);
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    fs::write(
        &paths.config_path,
        r#"
[agent]
command = ["storyloop-test-no-such-agent"]

[llm]
command = ["storyloop-test-no-such-model"]
max_attempts = 1
"#,
    )
    .expect("write config");

    let output = storyloop(temp.path(), &["build", "-n", "1"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("storyloop-test-no-such-agent"), "{stderr}");
    assert!(!paths.run_marker_path.exists());
    assert!(!paths.progress_path.exists());
}

#[test]
fn invalid_config_is_rejected() {
    let (temp, paths) = project_with(vec![open_story("US-001")]);
    fs::create_dir_all(&paths.state_dir).expect("state dir");
    fs::write(&paths.config_path, "prompt_budget_bytes = \"lots\"\n").expect("write config");

    let output = storyloop(temp.path(), &["status"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}
