//! Work performed once the whole fleet has finished.
//!
//! Tests always run before the host is terminated, and the host is only
//! terminated after the test runner's child process has exited. A test
//! failure is reported and never stops the kill step.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::output::{LineWriter, StreamKind};

const DEFAULT_RUNNERS: &[&str] = &["node_modules/.bin/mocha"];
const DEFAULT_TEST_DIR: &str = "test";
const DEFAULT_SETTINGS_FILE: &str = "settings.json";

/// How the test suite is found and run.
#[derive(Debug, Clone)]
pub struct TestRunSettings {
    /// Runner candidates, relative to the game directory; first existing wins.
    pub runners: Vec<String>,
    pub args: Vec<String>,
    /// Test directory, relative to the game directory.
    pub test_dir: String,
    pub settings_file: String,
}

impl Default for TestRunSettings {
    fn default() -> Self {
        Self {
            runners: DEFAULT_RUNNERS.iter().map(|s| s.to_string()).collect(),
            args: Vec::new(),
            test_dir: DEFAULT_TEST_DIR.to_string(),
            settings_file: DEFAULT_SETTINGS_FILE.to_string(),
        }
    }
}

/// Actions enabled for this run. Built before the fleet starts.
#[derive(Debug, Clone, Default)]
pub struct PostFleetActions {
    pub run_tests: Option<TestRunSettings>,
    pub kill_host: bool,
}

impl PostFleetActions {
    pub fn is_empty(&self) -> bool {
        self.run_tests.is_none() && !self.kill_host
    }
}

/// What the actions need to know about the finished fleet.
#[derive(Debug, Clone)]
pub struct FleetContext {
    pub channel: String,
    pub game_dir: PathBuf,
    pub size: usize,
    pub client_kind: String,
}

/// Result of the test step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    /// The runner exited unsuccessfully (None when killed by a signal).
    Failed { code: Option<i32> },
    RunnerNotFound { game_dir: PathBuf },
    /// Writing settings or starting the runner failed.
    Error(String),
}

impl TestOutcome {
    /// Exit code the host uses when it is terminated after this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            TestOutcome::Passed => 0,
            TestOutcome::Failed { code } => code.filter(|c| *c != 0).unwrap_or(1),
            TestOutcome::RunnerNotFound { .. } | TestOutcome::Error(_) => 1,
        }
    }
}

/// The process hosting the service.
pub trait Host: Send + Sync {
    /// Terminates the host. The real implementation does not return.
    fn terminate(&self, code: i32);
}

/// Exits the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHost;

impl Host for ProcessHost {
    fn terminate(&self, code: i32) {
        info!(code, "terminating host");
        std::process::exit(code);
    }
}

/// Result of running the post-fleet actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub tests: Option<TestOutcome>,
    pub host_terminated: bool,
}

/// Runs the enabled actions in order: tests, then host termination.
pub async fn run(
    actions: &PostFleetActions,
    context: &FleetContext,
    host: &dyn Host,
    writer: &LineWriter,
) -> ActionReport {
    let tests = match &actions.run_tests {
        Some(settings) => {
            let outcome = run_tests(settings, context, writer).await;
            match &outcome {
                TestOutcome::Passed => info!("tests passed"),
                TestOutcome::Failed { code } => warn!(?code, "tests failed"),
                TestOutcome::RunnerNotFound { game_dir } => {
                    error!("test runner not found in {}", game_dir.display())
                }
                TestOutcome::Error(err) => error!("could not run tests: {}", err),
            }
            Some(outcome)
        }
        None => None,
    };

    if actions.kill_host {
        let code = tests.as_ref().map(TestOutcome::exit_code).unwrap_or(0);
        host.terminate(code);
    }
    ActionReport {
        host_terminated: actions.kill_host,
        tests,
    }
}

/// Finds the first runner candidate that exists under `game_dir`.
pub fn locate_runner(game_dir: &Path, candidates: &[String]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|candidate| game_dir.join(candidate))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Writes the fleet settings file, copying an existing one to `<name>.bak` first.
pub fn write_settings(settings: &TestRunSettings, context: &FleetContext) -> Result<PathBuf> {
    let dir = context.game_dir.join(&settings.test_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create test dir {}", dir.display()))?;
    let path = dir.join(&settings.settings_file);
    if path.exists() {
        let backup = dir.join(format!("{}.bak", settings.settings_file));
        std::fs::copy(&path, &backup)
            .with_context(|| format!("failed to back up {}", path.display()))?;
        info!("backed up {} to {}", path.display(), backup.display());
    }
    let body = json!({
        "fleetSize": context.size,
        "channel": context.channel,
        "clientKind": context.client_kind,
    });
    let rendered = serde_json::to_string_pretty(&body)?;
    std::fs::write(&path, rendered)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

async fn run_tests(
    settings: &TestRunSettings,
    context: &FleetContext,
    writer: &LineWriter,
) -> TestOutcome {
    let Some(runner) = locate_runner(&context.game_dir, &settings.runners) else {
        return TestOutcome::RunnerNotFound {
            game_dir: context.game_dir.clone(),
        };
    };
    let settings_path = match write_settings(settings, context) {
        Ok(path) => path,
        Err(err) => return TestOutcome::Error(format!("{:#}", err)),
    };
    match spawn_runner(&runner, settings, context, &settings_path, writer).await {
        Ok(Some(0)) => TestOutcome::Passed,
        Ok(code) => TestOutcome::Failed { code },
        Err(err) => TestOutcome::Error(format!("{:#}", err)),
    }
}

async fn spawn_runner(
    runner: &Path,
    settings: &TestRunSettings,
    context: &FleetContext,
    settings_path: &Path,
    writer: &LineWriter,
) -> Result<Option<i32>> {
    info!("running tests: {} {}", runner.display(), settings.args.join(" "));
    let mut child = Command::new(runner)
        .args(&settings.args)
        .current_dir(&context.game_dir)
        .env("BOTRACK_TEST_SETTINGS", settings_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {}", runner.display()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("test runner stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("test runner stderr unavailable"))?;

    // Drain both streams before reaping so no output is lost.
    tokio::join!(
        stream_lines(stdout, StreamKind::Stdout, writer),
        stream_lines(stderr, StreamKind::Stderr, writer),
    );
    let status = child.wait().await?;
    Ok(status.code())
}

async fn stream_lines<R>(reader: R, stream: StreamKind, writer: &LineWriter)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        writer.emit("tests", 0, &line, stream);
    }
}
