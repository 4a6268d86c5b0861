//! One worker OS process and the tasks that feed and drain it.

use crate::error::{LivescribeError, Result};
use crate::models::ModelDescriptor;
use crate::worker::protocol::{WorkerInput, WorkerOutput, read_frame_async, write_frame_async};
use crate::worker::queue::{InputQueue, OutputQueue, OutputRouter, WorkerQueues};
use crate::worker::settings::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long trailing results may keep arriving after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Shared view of a worker's state, updated by its reader task too.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<WorkerState>>);

impl StateCell {
    pub fn new(state: WorkerState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn get(&self) -> WorkerState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, state: WorkerState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Record an exit nobody asked for. Returns whether it was unexpected.
    fn mark_exited(&self) -> bool {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            WorkerState::Starting | WorkerState::Running => {
                *state = WorkerState::Stopped;
                true
            }
            _ => false,
        }
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The worker exited on its own after Stop.
    Exited,
    /// The worker had to be killed.
    Killed,
}

/// Builds the command line of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    prefix_args: Vec<String>,
    settings: WorkerSettings,
    verbosity: u8,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, settings: WorkerSettings) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            settings,
            verbosity: 0,
        }
    }

    /// Launch workers from the running executable.
    pub fn current_exe(settings: WorkerSettings) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, settings))
    }

    /// Arguments placed before the `worker` subcommand.
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn args(&self, model: &ModelDescriptor) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend((0..self.verbosity).map(|_| "-v".to_string()));
        args.push("worker".to_string());
        args.push("--model".to_string());
        args.push(model.id.to_string());
        args.extend(self.settings.to_args());
        args
    }

    pub fn command(&self, model: &ModelDescriptor) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(model))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

/// A running (or stopped) worker process.
pub struct WorkerProcess {
    model: &'static ModelDescriptor,
    state: StateCell,
    child: Child,
    pid: Option<u32>,
    loaded: bool,
    reaped: bool,
    queues: WorkerQueues,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("model", &self.model.id)
            .field("state", &self.state.get())
            .field("pid", &self.pid)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl WorkerProcess {
    /// Spawn a worker and wait for it to report `Ready`.
    ///
    /// # Errors
    /// `WorkerStartup` if the process cannot be launched or exits early,
    /// `WorkerTimeout` if it stays silent past `startup_timeout` (it is killed).
    pub async fn spawn(
        model: &'static ModelDescriptor,
        launcher: &WorkerLauncher,
        startup_timeout: Duration,
    ) -> Result<Self> {
        let startup_error = |message: String| LivescribeError::WorkerStartup {
            model: model.id.to_string(),
            message,
        };

        let mut child = launcher
            .command(model)
            .spawn()
            .map_err(|e| startup_error(e.to_string()))?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(startup_error("worker stdio was not captured".to_string()));
        };
        info!(model = model.id, pid, "worker spawned");

        let state = StateCell::new(WorkerState::Starting);
        let (input, input_rx) = InputQueue::new(model.id);
        let (output, router) = OutputQueue::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let writer = tokio::spawn(feed_input(model.id, stdin, input_rx));
        let reader = tokio::spawn(drain_output(
            model.id,
            BufReader::new(stdout),
            router,
            ready_tx,
            state.clone(),
        ));

        let mut process = Self {
            model,
            state,
            child,
            pid,
            loaded: false,
            reaped: false,
            queues: WorkerQueues { input, output },
            writer,
            reader,
        };

        match tokio::time::timeout(startup_timeout, ready_rx).await {
            Ok(Ok(loaded)) => {
                process.loaded = loaded;
                process.state.set(WorkerState::Running);
                info!(model = model.id, pid, loaded, "worker running");
                Ok(process)
            }
            Ok(Err(_)) => {
                let status = process.child.wait().await.ok();
                process.state.set(WorkerState::Stopped);
                Err(startup_error(match status {
                    Some(status) => format!("exited before reporting ready ({status})"),
                    None => "exited before reporting ready".to_string(),
                }))
            }
            Err(_) => {
                warn!(model = model.id, pid, "worker did not report ready, killing");
                process.kill().await;
                process.state.set(WorkerState::Stopped);
                Err(LivescribeError::WorkerTimeout {
                    model: model.id.to_string(),
                    timeout_ms: startup_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn id(&self) -> &'static str {
        self.model.id
    }

    pub fn model(&self) -> &'static ModelDescriptor {
        self.model
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the model loaded, as opposed to running degraded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn queues(&self) -> WorkerQueues {
        self.queues.clone()
    }

    /// Running and the OS process still alive.
    pub fn is_running(&mut self) -> bool {
        if self.state.get() != WorkerState::Running {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(model = self.model.id, pid = self.pid, %status, "worker exited unexpectedly");
                self.state.set(WorkerState::Stopped);
                false
            }
            Err(e) => {
                warn!(model = self.model.id, error = %e, "cannot poll worker");
                false
            }
        }
    }

    /// Send Stop, wait up to `timeout`, then kill. Repeated calls return
    /// `Exited` without touching the process again.
    pub async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        if self.reaped {
            return StopOutcome::Exited;
        }
        self.state.set(WorkerState::Stopping);
        if self.queues.input.put_nowait(WorkerInput::Stop).is_err() {
            debug!(model = self.model.id, "input queue already closed");
        }

        let outcome = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(model = self.model.id, pid = self.pid, %status, "worker exited");
                StopOutcome::Exited
            }
            Ok(Err(e)) => {
                warn!(model = self.model.id, error = %e, "waiting for worker failed, killing");
                self.kill().await;
                StopOutcome::Killed
            }
            Err(_) => {
                warn!(
                    model = self.model.id,
                    pid = self.pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not stop in time, killing"
                );
                self.kill().await;
                StopOutcome::Killed
            }
        };

        self.writer.abort();
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut self.reader)
            .await
            .is_err()
        {
            self.reader.abort();
        }
        self.reaped = true;
        self.state.set(WorkerState::Stopped);
        outcome
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            error!(model = self.model.id, pid = self.pid, error = %e, "failed to kill worker");
        }
    }
}

/// Write queued items to the worker's stdin.
///
/// An item that cannot be framed is logged and skipped; only a broken pipe
/// ends the task.
async fn feed_input<W: AsyncWrite + Unpin>(
    model: &'static str,
    mut stdin: W,
    mut items: mpsc::UnboundedReceiver<WorkerInput>,
) {
    while let Some(item) = items.recv().await {
        match write_frame_async(&mut stdin, &item).await {
            Ok(()) => {}
            Err(e @ LivescribeError::Frame { .. }) => {
                warn!(model, error = %e, "dropping input item that cannot be framed");
            }
            Err(e) => {
                debug!(model, error = %e, "worker stdin closed");
                break;
            }
        }
    }
}

async fn drain_output<R: AsyncRead + Unpin>(
    model: &'static str,
    mut stdout: R,
    results: OutputRouter,
    ready: oneshot::Sender<bool>,
    state: StateCell,
) {
    let mut ready = Some(ready);
    loop {
        match read_frame_async::<_, WorkerOutput>(&mut stdout).await {
            Ok(Some(WorkerOutput::Ready { loaded, .. })) => {
                if let Some(tx) = ready.take() {
                    tx.send(loaded).ok();
                }
            }
            Ok(Some(WorkerOutput::Result(result))) => {
                if !results.dispatch(result) {
                    debug!(model, "no receiver for worker result");
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(model, error = %e, "corrupted output from worker");
                break;
            }
        }
    }
    if state.mark_exited() {
        warn!(model, "worker output closed unexpectedly");
    }
}
