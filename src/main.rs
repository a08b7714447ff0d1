//! botrack: launches a fleet of headless bots against a channel and acts when they are done.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, resolves credentials and hands the fleet to the
//! supervisor. Once every bot has finished the configured post-fleet actions
//! run (tests, then host termination).

mod actions;
mod barrier;
mod bot;
mod channel;
mod config;
mod credentials;
mod error;
mod events;
mod launcher;
mod output;
mod stagger;
mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::actions::{PostFleetActions, ProcessHost, TestOutcome, TestRunSettings};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::credentials::{load_credential_table, CredentialPlan};
use crate::events::ProcessSignal;
use crate::output::OutputSettings;
use crate::supervisor::{FleetReport, FleetSpec, Supervisor};

const DEFAULT_CONFIG: &str = "botrack.toml";
const DEFAULT_CLIENT_KIND: &str = "autoplay";
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 800;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "botrack",
    version,
    about = "Launch a fleet of headless bots and act when they finish",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to botrack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any botrack.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Channel the bots connect to.
    #[arg(short = 'n', long)]
    channel: Option<String>,
    /// Number of bots to launch.
    #[arg(short = 'N', long)]
    bots: Option<usize>,
    /// Behavior profile passed to every bot.
    #[arg(long)]
    client_kind: Option<String>,
    /// Query string appended to each bot's connection request.
    #[arg(short = 'q', long)]
    query: Option<String>,
    /// Delay between successive bot launches (ms).
    #[arg(short = 'w', long)]
    stagger_ms: Option<u64>,
    /// Credential for every bot: new, next, or id:password.
    #[arg(short = 'a', long)]
    auth: Option<String>,
    /// JSON credential table, one record per bot (takes precedence over --auth).
    #[arg(long)]
    auth_file: Option<PathBuf>,
    /// Run the channel's tests once every bot has finished.
    #[arg(short = 't', long)]
    run_tests: bool,
    /// Exit once every bot (and the tests) have finished.
    #[arg(short = 'k', long)]
    kill_host: bool,
    /// Prefix template for child output (e.g. "[{name}]").
    #[arg(long)]
    prefix: Option<String>,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Strip ANSI escape codes from child output.
    #[arg(long)]
    strip_ansi: bool,
    /// Print child output without prefixes.
    #[arg(long)]
    raw: bool,
    /// Time to wait for bots to exit after an interrupt (ms).
    #[arg(long)]
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show help information.
    Help,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("botrack=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Some(command) = &cli.command {
        match command {
            Commands::Help => {
                Cli::command().print_help()?;
                println!();
                return Ok(());
            }
            Commands::Version => {
                println!("botrack {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
        }
    }

    let (config, base) = load_config(&cli)?;
    let settings = RunSettings::from_cli(&cli, &config, &base)?;
    if settings.fleet.size == 0 {
        info!("no bots requested, nothing to do");
        return Ok(());
    }

    let channels = ChannelRegistry::from_config(config.channels, &base);
    let table = settings
        .auth_file
        .as_deref()
        .map(load_credential_table)
        .transpose()?;
    let plan = CredentialPlan::from_sources(settings.auth.as_deref(), table)?;

    let supervisor = Supervisor::new(
        settings.output.clone(),
        Arc::new(ProcessHost),
        Duration::from_millis(settings.shutdown_grace_ms),
    );
    let run = supervisor
        .launch_fleet(&channels, settings.fleet.clone(), plan, settings.actions.clone())
        .with_context(|| format!("known channels: [{}]", channels.names().join(", ")))?;
    let Some(mut run) = run else {
        return Ok(());
    };

    let report = tokio::select! {
        report = run.wait() => report?,
        signal = wait_for_signal() => {
            run.interrupt(signal).await;
            run.wait().await?
        }
    };
    log_report(&report);
    if report.interrupted {
        return Ok(());
    }

    info!("fleet finished, host keeps running (ctrl-c to exit)");
    let signal = wait_for_signal().await;
    info!("received {}, exiting", signal.label());
    Ok(())
}

fn log_report(report: &FleetReport) {
    let Some(summary) = &report.summary else {
        warn!("fleet interrupted before every bot finished");
        if !report.still_running.is_empty() {
            warn!(bots = ?report.still_running, "bots did not exit in time");
        }
        return;
    };
    info!(
        "{} bots finished, {} abnormally",
        summary.total,
        summary.abnormal()
    );
    if let Some(TestOutcome::Failed { code }) = report.actions.as_ref().and_then(|a| a.tests.as_ref()) {
        warn!(?code, "test run failed");
    }
}

async fn wait_for_signal() -> ProcessSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return ProcessSignal::SigInt;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
            _ = sigterm.recv() => ProcessSignal::SigTerm,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ProcessSignal::SigInt
    }
}

/// Loads the config file, if any, and returns it with the directory relative paths resolve against.
fn load_config(cli: &Cli) -> Result<(Config, PathBuf)> {
    let cwd = std::env::current_dir().context("failed to resolve current dir")?;
    if cli.no_config {
        return Ok((Config::default(), cwd));
    }
    let path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|path| path.exists()));
    let Some(path) = path else {
        return Ok((Config::default(), cwd));
    };
    let config = config::load_config(&path)?;
    let base = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
        _ => cwd,
    };
    Ok((config, base))
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    fleet: FleetSpec,
    auth: Option<String>,
    auth_file: Option<PathBuf>,
    actions: PostFleetActions,
    output: OutputSettings,
    shutdown_grace_ms: u64,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config, base: &Path) -> Result<Self> {
        let meta = &config.fleet;
        let size = cli.bots.or(meta.bots).unwrap_or(0);
        let channel = cli.channel.clone().or_else(|| meta.channel.clone());
        let channel = match channel {
            Some(channel) => channel,
            None if size == 0 => String::new(),
            None => bail!("no channel given for {} bots (use --channel or [fleet] channel)", size),
        };
        let fleet = FleetSpec {
            channel,
            size,
            client_kind: cli
                .client_kind
                .clone()
                .or_else(|| meta.client_kind.clone())
                .unwrap_or_else(|| DEFAULT_CLIENT_KIND.to_string()),
            query: cli.query.clone().or_else(|| meta.query.clone()),
            stagger_ms: cli.stagger_ms.or(meta.stagger_ms),
        };

        let auth_file = cli
            .auth_file
            .clone()
            .or_else(|| meta.auth_file.as_ref().map(|path| base.join(path)));

        let run_tests = cli.run_tests || meta.run_tests.unwrap_or(false);
        let actions = PostFleetActions {
            run_tests: run_tests.then(|| test_settings(config)),
            kill_host: cli.kill_host || meta.kill_host.unwrap_or(false),
        };

        let output = OutputSettings {
            prefix: cli.prefix.clone().or_else(|| config.prefix.clone()),
            timestamp: cli.timestamp || config.timestamp.unwrap_or(false),
            strip_ansi: cli.strip_ansi || config.strip_ansi.unwrap_or(false),
            raw: cli.raw || config.raw.unwrap_or(false),
        };

        Ok(Self {
            fleet,
            auth: cli.auth.clone().or_else(|| meta.auth.clone()),
            auth_file,
            actions,
            output,
            shutdown_grace_ms: cli
                .shutdown_grace_ms
                .or(config.shutdown_grace_ms)
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
        })
    }
}

fn test_settings(config: &Config) -> TestRunSettings {
    let defaults = TestRunSettings::default();
    let Some(tests) = &config.tests else {
        return defaults;
    };
    TestRunSettings {
        runners: tests.runner.clone().unwrap_or(defaults.runners),
        args: tests.args.clone().unwrap_or(defaults.args),
        test_dir: tests.test_dir.clone().unwrap_or(defaults.test_dir),
        settings_file: tests.settings_file.clone().unwrap_or(defaults.settings_file),
    }
}
