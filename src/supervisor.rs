//! Fleet launch and supervision.
//!
//! `Supervisor::launch_fleet` checks every precondition up front, launches the
//! bots that are due immediately, and hands the rest of the run to a single
//! task that owns all fleet state. That task launches staggered bots as their
//! timers fire, prints bot output, counts completions, and runs the post-fleet
//! actions once the last bot has finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionReport, FleetContext, Host, PostFleetActions};
use crate::barrier::{CompletionBarrier, FleetSummary, Progress};
use crate::bot::{BotExit, BotHandle, ConnectRequest};
use crate::channel::{Channel, ChannelRegistry};
use crate::credentials::{CredentialPlan, CredentialSource};
use crate::error::FleetError;
use crate::events::{Event, ProcessSignal};
use crate::launcher::send_os_signal;
use crate::output::{bot_name, LineWriter, OutputSettings};
use crate::stagger;

/// What to launch.
#[derive(Debug, Clone)]
pub struct FleetSpec {
    /// Channel every bot connects to.
    pub channel: String,
    /// Number of bots; zero means no fleet at all.
    pub size: usize,
    /// Behavior profile tag handed to every bot.
    pub client_kind: String,
    /// Appended to each bot's connection request.
    pub query: Option<String>,
    /// Delay between successive launches; `None` launches everything at once.
    pub stagger_ms: Option<u64>,
}

/// How a fleet run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetReport {
    /// Set once every bot finished.
    pub summary: Option<FleetSummary>,
    /// Set when post-fleet actions ran.
    pub actions: Option<ActionReport>,
    /// The operator stopped the run before it completed.
    pub interrupted: bool,
    /// Bots still running when the shutdown grace period ran out.
    pub still_running: Vec<usize>,
}

/// A fleet in flight.
pub struct FleetRun {
    events: mpsc::Sender<Event>,
    task: JoinHandle<FleetReport>,
}

impl FleetRun {
    /// Stops the run: live bots are signaled and post-fleet actions are skipped.
    ///
    /// Has no effect once every bot has finished; post-fleet actions that are
    /// already running are not cut short.
    pub async fn interrupt(&self, signal: ProcessSignal) {
        let _ = self.events.send(Event::Shutdown { signal }).await;
    }

    /// Waits for the run to end. Call again after `interrupt` if a wait was abandoned.
    pub async fn wait(&mut self) -> Result<FleetReport> {
        (&mut self.task).await.context("fleet task panicked")
    }
}

pub struct Supervisor {
    output: OutputSettings,
    host: Arc<dyn Host>,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(output: OutputSettings, host: Arc<dyn Host>, shutdown_grace: Duration) -> Self {
        Self {
            output,
            host,
            shutdown_grace,
        }
    }

    /// Starts a fleet.
    ///
    /// Returns `Ok(None)` when no bots were requested. Any `FleetError` is
    /// returned before a single bot is launched. Must be called from within a
    /// tokio runtime; returns without waiting for any bot.
    pub fn launch_fleet(
        &self,
        channels: &ChannelRegistry,
        spec: FleetSpec,
        plan: CredentialPlan,
        actions: PostFleetActions,
    ) -> Result<Option<FleetRun>, FleetError> {
        if spec.size == 0 {
            debug!("no bots requested");
            return Ok(None);
        }
        let channel = channels
            .resolve(&spec.channel)
            .ok_or_else(|| FleetError::ChannelNotFound(spec.channel.clone()))?;
        if plan.requests_auth() && !channel.supports_auth() {
            return Err(FleetError::AuthUnsupported {
                channel: spec.channel.clone(),
                requested: plan.describe(),
            });
        }
        let plan_description = plan.describe();
        let credentials = CredentialSource::new(plan, spec.size)?;
        let interval = stagger::validate_interval(spec.size, spec.stagger_ms)?;

        info!(
            channel = %spec.channel,
            bots = spec.size,
            stagger_ms = ?spec.stagger_ms,
            "launching fleet ({})",
            plan_description
        );

        let (events, rx) = mpsc::channel(256);
        let mut fleet = Fleet {
            barrier: CompletionBarrier::new(spec.size),
            spec,
            channel,
            credentials,
            actions,
            host: Arc::clone(&self.host),
            output: LineWriter::new(self.output.clone()),
            shutdown_grace: self.shutdown_grace,
            events: events.clone(),
            pids: HashMap::new(),
        };
        for index in stagger::schedule_all(fleet.spec.size, interval, &events) {
            fleet.launch(index);
        }
        let task = tokio::spawn(fleet.run(rx));
        Ok(Some(FleetRun { events, task }))
    }
}

/// All state of one fleet run, owned by the fleet task.
struct Fleet {
    spec: FleetSpec,
    channel: Arc<dyn Channel>,
    credentials: CredentialSource,
    barrier: CompletionBarrier,
    actions: PostFleetActions,
    host: Arc<dyn Host>,
    output: LineWriter,
    shutdown_grace: Duration,
    events: mpsc::Sender<Event>,
    pids: HashMap<usize, u32>,
}

impl Fleet {
    fn launch(&mut self, index: usize) {
        let Some(credential) = self.credentials.resolve(index) else {
            return;
        };
        if !self.barrier.mark_launched(index) {
            return;
        }
        let total = self.spec.size;
        info!(
            index,
            total,
            "starting bot {}/{} ({})",
            index + 1,
            total,
            credential.summary()
        );
        let request = ConnectRequest {
            index,
            total,
            client_kind: self.spec.client_kind.clone(),
            query: self.spec.query.clone(),
            credential,
        };
        let handle = match self.channel.connect(request, self.events.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                error!(index, "bot {} failed to start: {:#}", index, err);
                BotHandle::failed(index, format!("{:#}", err))
            }
        };
        if let Some(pid) = handle.pid() {
            self.pids.insert(index, pid);
        }
        let tx = self.events.clone();
        tokio::spawn(async move {
            let index = handle.index();
            let exit = handle.finished().await;
            let _ = tx.send(Event::BotFinished { index, exit }).await;
        });
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Event>) -> FleetReport {
        while let Some(event) = rx.recv().await {
            match event {
                Event::LaunchDue { index } => self.launch(index),
                Event::BotOutput {
                    index,
                    line,
                    stream,
                } => self.output.emit(&bot_name(index), index, &line, stream),
                Event::BotFinished { index, exit } => {
                    self.pids.remove(&index);
                    match &exit {
                        BotExit::Exited { code: Some(0) } => info!(index, "bot {} {}", index, exit),
                        _ => warn!(index, "bot {} {}", index, exit),
                    }
                    match self.barrier.on_bot_finished(index, exit) {
                        Progress::Counted { completed, total } => {
                            debug!(completed, total, launched = self.barrier.launched(), "fleet progress")
                        }
                        Progress::Complete(summary) => return self.finish(summary).await,
                        Progress::Ignored => warn!(index, "ignoring repeated completion"),
                    }
                }
                Event::Shutdown { signal } => return self.interrupt(signal, &mut rx).await,
            }
        }
        FleetReport {
            summary: None,
            actions: None,
            interrupted: true,
            still_running: Vec::new(),
        }
    }

    async fn finish(self, summary: FleetSummary) -> FleetReport {
        info!(
            total = summary.total,
            abnormal = summary.abnormal(),
            "all bots finished"
        );
        let actions = if self.actions.is_empty() {
            None
        } else {
            let context = FleetContext {
                channel: self.spec.channel.clone(),
                game_dir: self.channel.game_directory().to_path_buf(),
                size: self.spec.size,
                client_kind: self.spec.client_kind.clone(),
            };
            Some(actions::run(&self.actions, &context, self.host.as_ref(), &self.output).await)
        };
        FleetReport {
            summary: Some(summary),
            actions,
            interrupted: false,
            still_running: Vec::new(),
        }
    }

    async fn interrupt(mut self, signal: ProcessSignal, rx: &mut mpsc::Receiver<Event>) -> FleetReport {
        let running: Vec<usize> = self.barrier.running().collect();
        warn!(
            running = running.len(),
            completed = self.barrier.completed(),
            "received {}, stopping fleet without post-fleet actions",
            signal.label()
        );
        for pid in self.pids.values() {
            send_os_signal(*pid, signal);
        }
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while !self.pids.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Event::BotFinished { index, exit })) => {
                    debug!(index, "bot {} {} during shutdown", index, exit);
                    self.pids.remove(&index);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        let mut still_running: Vec<usize> = self.pids.keys().copied().collect();
        still_running.sort_unstable();
        if !still_running.is_empty() {
            warn!(?still_running, "bots still running after grace period");
        }
        FleetReport {
            summary: None,
            actions: None,
            interrupted: true,
            still_running,
        }
    }
}
