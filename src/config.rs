//! Configuration management for botrack.
//!
//! This module defines the structure of the `botrack.toml` configuration file
//! and provides functionality to load and parse it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `botrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Template for line prefixes (e.g., "[{name}]").
    pub prefix: Option<String>,
    /// Whether to prepend elapsed time to output lines.
    pub timestamp: Option<bool>,
    /// Whether to strip ANSI escape codes from child output.
    pub strip_ansi: Option<bool>,
    /// Whether to print child output without prefixes.
    pub raw: Option<bool>,
    /// Time to wait for bots to exit after an interrupt (ms).
    pub shutdown_grace_ms: Option<u64>,
    /// Fleet defaults; CLI flags override each field.
    #[serde(default)]
    pub fleet: FleetConfig,
    /// Test runner settings.
    pub tests: Option<TestsConfig>,
    /// Channels bots can connect to.
    #[serde(rename = "channel", default)]
    pub channels: Vec<ChannelConfig>,
}

/// The `[fleet]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    /// Channel the fleet connects to.
    pub channel: Option<String>,
    /// Number of bots.
    pub bots: Option<usize>,
    /// Behavior profile passed to every bot.
    pub client_kind: Option<String>,
    /// Query string appended to each bot's connection request.
    pub query: Option<String>,
    /// Delay between successive launches (ms).
    pub stagger_ms: Option<u64>,
    /// `new`, `next`, or `id:password`.
    pub auth: Option<String>,
    /// JSON credential table, one record per bot.
    pub auth_file: Option<String>,
    /// Run the channel's tests once every bot has finished.
    pub run_tests: Option<bool>,
    /// Exit the host once every bot (and the tests) have finished.
    pub kill_host: Option<bool>,
}

/// A `[[channel]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Game directory; relative paths resolve against the config file.
    pub game_dir: String,
    /// Command template for one bot (`{index}`, `{total}`, `{channel}`, `{client}`, `{query}`).
    pub bot_cmd: String,
    /// Whether the channel accepts credentials (default: false).
    pub auth: Option<bool>,
    /// Extra environment for every bot.
    pub env: Option<HashMap<String, String>>,
}

/// The `[tests]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestsConfig {
    /// Runner candidates relative to the game directory.
    pub runner: Option<Vec<String>>,
    /// Arguments passed to the runner.
    pub args: Option<Vec<String>>,
    /// Test directory relative to the game directory.
    pub test_dir: Option<String>,
    /// Name of the generated settings file.
    pub settings_file: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
