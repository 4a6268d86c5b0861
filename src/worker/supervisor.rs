//! Owns the single active worker and the switch between models.
//!
//! Every start/stop goes through one async mutex, so a switch always stops
//! the old worker before the new one is spawned and concurrent switches
//! serialize. Readers never take that mutex: the current worker is published
//! through a `watch` channel and read without blocking.

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::models::{Catalog, ModelDescriptor, Workflow};
use crate::worker::process::{StateCell, StopOutcome, WorkerLauncher, WorkerProcess, WorkerState};
use crate::worker::queue::WorkerQueues;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub stop_timeout: Duration,
    pub startup_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout(),
            startup_timeout: config.startup_timeout(),
        }
    }
}

/// Snapshot of the most recently started worker.
///
/// The state cell is live, so a snapshot taken before a crash or a stop
/// reports it.
#[derive(Debug, Clone)]
pub struct ActiveWorker {
    pub model: &'static ModelDescriptor,
    pub pid: Option<u32>,
    pub loaded: bool,
    /// Increases with every successful start.
    pub generation: u64,
    state: StateCell,
    queues: WorkerQueues,
}

impl ActiveWorker {
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }
}

/// Result of [`ModelSupervisor::start_model`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSwitch {
    pub previous: Option<String>,
    pub current: String,
    /// False when the model was already running.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub model: Option<String>,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub loaded: bool,
    pub workflow: Option<Workflow>,
    pub generation: u64,
}

pub struct ModelSupervisor {
    catalog: Catalog,
    launcher: WorkerLauncher,
    settings: SupervisorSettings,
    current: Mutex<Option<WorkerProcess>>,
    active: watch::Sender<Option<ActiveWorker>>,
    generation: AtomicU64,
}

impl ModelSupervisor {
    pub fn new(catalog: Catalog, launcher: WorkerLauncher, settings: SupervisorSettings) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            catalog,
            launcher,
            settings,
            current: Mutex::new(None),
            active,
            generation: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Make `name` the active model.
    ///
    /// Unknown names are rejected before anything is torn down. Starting the
    /// model that is already running is a no-op. Otherwise the current worker
    /// is stopped (and killed if it ignores Stop) before the new one spawns.
    ///
    /// # Errors
    /// `UnknownModel`, `WorkerStartup` or `WorkerTimeout`. After a failed
    /// start no model is active.
    pub async fn start_model(&self, name: &str) -> Result<ModelSwitch> {
        let model = self.catalog.resolve(name)?;
        let mut current = self.current.lock().await;

        let previous = current
            .as_mut()
            .and_then(|worker| worker.is_running().then(|| worker.id().to_string()));
        if previous.as_deref() == Some(model.id) {
            debug!(model = model.id, "model already active");
            return Ok(ModelSwitch {
                previous,
                current: model.id.to_string(),
                changed: false,
            });
        }

        if let Some(mut old) = current.take() {
            let outcome = old.stop(self.settings.stop_timeout).await;
            info!(model = old.id(), ?outcome, "previous worker stopped");
        }

        let worker = WorkerProcess::spawn(model, &self.launcher, self.settings.startup_timeout).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.send_replace(Some(ActiveWorker {
            model,
            pid: worker.pid(),
            loaded: worker.is_loaded(),
            generation,
            state: worker.state_cell(),
            queues: worker.queues(),
        }));
        info!(
            model = model.id,
            previous = previous.as_deref().unwrap_or("none"),
            generation,
            "model active"
        );
        *current = Some(worker);

        Ok(ModelSwitch {
            previous,
            current: model.id.to_string(),
            changed: true,
        })
    }

    /// Stop the current worker. `None` if none was live.
    pub async fn stop_current_model(&self) -> Option<StopOutcome> {
        let mut current = self.current.lock().await;
        let worker = current.as_mut()?;
        let was_live = worker.state() != WorkerState::Stopped;
        let outcome = worker.stop(self.settings.stop_timeout).await;
        if was_live {
            info!(model = worker.id(), ?outcome, "model stopped");
        }
        was_live.then_some(outcome)
    }

    /// Stop the worker only if it still serves `name`.
    pub async fn stop_model_if_current(&self, name: &str) -> Option<StopOutcome> {
        let mut current = self.current.lock().await;
        let worker = current.as_mut().filter(|w| w.id() == name)?;
        if worker.state() == WorkerState::Stopped {
            return None;
        }
        let outcome = worker.stop(self.settings.stop_timeout).await;
        info!(model = name, ?outcome, "idle model stopped");
        Some(outcome)
    }

    /// Queues of the worker serving `name`, if it is the running model.
    /// Never blocks.
    pub fn get_active_queues(&self, name: &str) -> Option<WorkerQueues> {
        let active = self.active.borrow();
        let worker = active.as_ref()?;
        (worker.model.id == name && worker.is_running()).then(|| worker.queues.clone())
    }

    /// Id of the running model, if any.
    pub fn current_model(&self) -> Option<&'static str> {
        let active = self.active.borrow();
        active
            .as_ref()
            .filter(|w| w.is_running())
            .map(|w| w.model.id)
    }

    /// Follow worker changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveWorker>> {
        self.active.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        let active = self.active.borrow();
        match active.as_ref() {
            Some(worker) => SupervisorStatus {
                model: Some(worker.model.id.to_string()),
                state: worker.state(),
                pid: worker.pid,
                loaded: worker.loaded,
                workflow: Some(worker.model.workflow),
                generation: worker.generation,
            },
            None => SupervisorStatus {
                model: None,
                state: WorkerState::Idle,
                pid: None,
                loaded: false,
                workflow: None,
                generation: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::LivescribeError;
    use crate::worker::settings::WorkerSettings;

    fn supervisor(program: &str) -> ModelSupervisor {
        let config = Config::default();
        ModelSupervisor::new(
            Catalog::builtin(),
            WorkerLauncher::new(program, WorkerSettings::from_config(&config)),
            SupervisorSettings {
                stop_timeout: Duration::from_millis(500),
                startup_timeout: Duration::from_millis(500),
            },
        )
    }

    #[tokio::test]
    async fn test_idle_supervisor() {
        let supervisor = supervisor("/nonexistent/livescribe");
        let status = supervisor.status();
        assert_eq!(status.state, WorkerState::Idle);
        assert_eq!(status.model, None);
        assert!(supervisor.current_model().is_none());
        assert!(supervisor.get_active_queues("loopback-streaming").is_none());
        assert!(supervisor.stop_current_model().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_before_spawn() {
        let supervisor = supervisor("/nonexistent/livescribe");
        let err = supervisor.start_model("no-such-model").await.unwrap_err();
        match err {
            LivescribeError::UnknownModel { name, valid } => {
                assert_eq!(name, "no-such-model");
                assert!(valid.contains("loopback-streaming"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(supervisor.status().state, WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_active_model() {
        let supervisor = supervisor("/nonexistent/livescribe");
        let err = supervisor.start_model("loopback-streaming").await.unwrap_err();
        assert!(matches!(err, LivescribeError::WorkerStartup { .. }));
        assert!(supervisor.current_model().is_none());
        assert_eq!(supervisor.status().generation, 0);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.supervisor.stop_timeout_ms = 250;
        let settings = SupervisorSettings::from_config(&config.supervisor);
        assert_eq!(settings.stop_timeout, Duration::from_millis(250));
        assert_eq!(settings.startup_timeout, Duration::from_secs(30));
    }
}
