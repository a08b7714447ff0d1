//! Channels bots connect to.
//!
//! A channel is a named unit of the hosted service. The supervisor only needs
//! to know where its game directory is, whether it accepts credentials, and how
//! to start a bot against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::bot::{BotHandle, ConnectRequest};
use crate::config::ChannelConfig;
use crate::events::Event;
use crate::launcher::{spawn_bot, BotCommand};

pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Directory holding the channel's game files and tests.
    fn game_directory(&self) -> &Path;

    fn supports_auth(&self) -> bool;

    /// Starts one bot. Output goes to `events`; the handle completes on exit.
    fn connect(&self, request: ConnectRequest, events: mpsc::Sender<Event>) -> Result<BotHandle>;
}

/// A channel whose bots are external processes.
#[derive(Debug, Clone)]
pub struct ProcessChannel {
    name: String,
    game_dir: PathBuf,
    bot_cmd: String,
    auth: bool,
    env: HashMap<String, String>,
}

impl ProcessChannel {
    /// Builds a channel from config; relative game dirs resolve against `base`.
    pub fn from_config(config: ChannelConfig, base: &Path) -> Self {
        let game_dir = PathBuf::from(&config.game_dir);
        let game_dir = if game_dir.is_absolute() {
            game_dir
        } else {
            base.join(game_dir)
        };
        Self {
            name: config.name,
            game_dir,
            bot_cmd: config.bot_cmd,
            auth: config.auth.unwrap_or(false),
            env: config.env.unwrap_or_default(),
        }
    }
}

impl Channel for ProcessChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn game_directory(&self) -> &Path {
        &self.game_dir
    }

    fn supports_auth(&self) -> bool {
        self.auth
    }

    fn connect(&self, request: ConnectRequest, events: mpsc::Sender<Event>) -> Result<BotHandle> {
        let command = BotCommand::render(
            &self.bot_cmd,
            &self.name,
            self.game_dir.clone(),
            &self.env,
            &request,
        )?;
        spawn_bot(request.index, &command, events)
    }
}

/// Channels known to this host, by name.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: Vec<ChannelConfig>, base: &Path) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.insert(Arc::new(ProcessChannel::from_config(config, base)));
        }
        registry
    }

    /// Adds a channel, replacing any channel with the same name.
    pub fn insert(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, game_dir: &str) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            game_dir: game_dir.to_string(),
            bot_cmd: "node phantom.js".to_string(),
            auth: Some(true),
            env: None,
        }
    }

    #[test]
    fn resolves_configured_channels() {
        let registry = ChannelRegistry::from_config(
            vec![config("ultimatum", "games/ultimatum"), config("lobby", "/srv/lobby")],
            Path::new("/srv/host"),
        );
        let channel = registry.resolve("ultimatum").unwrap();
        assert_eq!(channel.game_directory(), Path::new("/srv/host/games/ultimatum"));
        assert!(channel.supports_auth());
        assert_eq!(
            registry.resolve("lobby").unwrap().game_directory(),
            Path::new("/srv/lobby")
        );
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.names(), vec!["lobby", "ultimatum"]);
    }
}
