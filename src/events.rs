//! Event definitions for the fleet event loop.
//!
//! Timers, bot output readers and completion forwarders all run as separate
//! tasks; they only ever talk to the fleet through these events.

use crate::bot::BotExit;
use crate::output::StreamKind;

#[derive(Debug, Clone)]
pub enum Event {
    /// A staggered launch timer for this bot has elapsed.
    LaunchDue { index: usize },
    /// A line of output (stdout or stderr) was received from a bot.
    BotOutput {
        index: usize,
        line: String,
        stream: StreamKind,
    },
    /// A bot signaled completion.
    BotFinished { index: usize, exit: BotExit },
    /// The operator asked the host to stop.
    Shutdown { signal: ProcessSignal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }
}
