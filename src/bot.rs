//! Data structures for a single bot.
//!
//! This module defines what a bot is asked to do (`ConnectRequest`), how it
//! ended (`BotExit`), and the `BotHandle` the launcher hands back while the
//! bot is running.

use std::fmt;

use tokio::sync::oneshot;

use crate::credentials::Credential;

/// Everything a channel needs to start bot `index`.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Position of the bot in the fleet.
    pub index: usize,
    /// Fleet size.
    pub total: usize,
    /// Behavior profile tag passed through to the client.
    pub client_kind: String,
    /// Appended to the bot's connection request.
    pub query: Option<String>,
    pub credential: Credential,
}

/// How a bot finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotExit {
    /// Process exited with an optional exit code (None usually implies signal termination).
    Exited { code: Option<i32> },
    /// Process could not be started, or waiting on it failed.
    Failed { error: String },
}

impl BotExit {
    pub fn is_success(&self) -> bool {
        matches!(self, BotExit::Exited { code: Some(0) })
    }
}

impl fmt::Display for BotExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotExit::Exited { code: Some(0) } => write!(f, "exited successfully"),
            BotExit::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            BotExit::Exited { code: None } => write!(f, "exited"),
            BotExit::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A running bot.
///
/// The completion signal fires exactly once; `finished` consumes the handle.
#[derive(Debug)]
pub struct BotHandle {
    index: usize,
    pid: Option<u32>,
    completion: oneshot::Receiver<BotExit>,
}

impl BotHandle {
    /// Creates a handle and the sender that completes it.
    pub fn new(index: usize, pid: Option<u32>) -> (Self, oneshot::Sender<BotExit>) {
        let (tx, completion) = oneshot::channel();
        (
            Self {
                index,
                pid,
                completion,
            },
            tx,
        )
    }

    /// A handle for a bot that never started; it completes immediately.
    pub fn failed(index: usize, error: String) -> Self {
        let (handle, tx) = Self::new(index, None);
        let _ = tx.send(BotExit::Failed { error });
        handle
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the bot to finish.
    pub async fn finished(self) -> BotExit {
        self.completion.await.unwrap_or_else(|_| BotExit::Failed {
            error: "completion signal dropped".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_handle_completes_immediately() {
        let handle = BotHandle::failed(3, "no such file".into());
        assert_eq!(handle.index(), 3);
        assert_eq!(handle.pid(), None);
        assert_eq!(
            handle.finished().await,
            BotExit::Failed {
                error: "no such file".into()
            }
        );
    }

    #[tokio::test]
    async fn dropped_sender_still_completes() {
        let (handle, tx) = BotHandle::new(0, Some(42));
        drop(tx);
        assert!(matches!(handle.finished().await, BotExit::Failed { .. }));
    }

    #[test]
    fn exit_descriptions() {
        assert_eq!(BotExit::Exited { code: Some(0) }.to_string(), "exited successfully");
        assert_eq!(BotExit::Exited { code: Some(2) }.to_string(), "exited with code 2");
        assert!(BotExit::Exited { code: Some(0) }.is_success());
        assert!(!BotExit::Exited { code: None }.is_success());
    }
}
