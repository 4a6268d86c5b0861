//! Network side: shared state, the WebSocket endpoint and HTTP routes.

pub mod handler;
pub mod http;
pub mod messages;
pub mod ws;

pub use handler::{Inbound, Outbound, StreamingProtocolHandler};
pub use messages::{ClientMessage, ServerEvent, ServerMessage};

use crate::config::Config;
use crate::error::{LivescribeError, Result};
use crate::ipc::control::ControlHandler;
use crate::ipc::server::IpcServer;
use crate::models::Catalog;
use crate::moderation::ModerationRelay;
use crate::session::SessionRegistry;
use crate::store::MemoryTranscriptStore;
use crate::worker::{ModelSupervisor, ModelSwitch, SupervisorSettings, WorkerLauncher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Everything connection handlers share.
pub struct AppState {
    pub supervisor: ModelSupervisor,
    pub sessions: SessionRegistry,
    pub relay: ModerationRelay,
    pub config: Config,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: Config,
        supervisor: ModelSupervisor,
        sessions: SessionRegistry,
        relay: ModerationRelay,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            supervisor,
            sessions,
            relay,
            config,
            shutdown,
        }
    }

    /// Wire up the default collaborators around `launcher`.
    pub fn from_config(config: Config, launcher: WorkerLauncher) -> Self {
        let supervisor = ModelSupervisor::new(
            Catalog::builtin(),
            launcher,
            SupervisorSettings::from_config(&config.supervisor),
        );
        let relay = ModerationRelay::from_config(&config.moderation, Arc::new(MemoryTranscriptStore::new()));
        Self::new(config, supervisor, SessionRegistry::new(), relay)
    }

    /// Start `name` and reconcile sessions bound to the old model.
    ///
    /// With `keep_sessions` the old sessions follow the new model, otherwise
    /// they are deactivated and their clients must reconfigure.
    pub async fn switch_model(&self, name: &str, keep_sessions: bool) -> Result<ModelSwitch> {
        let switch = self.supervisor.start_model(name).await?;
        if switch.changed {
            self.sessions.retarget(&switch.current, keep_sessions);
        }
        Ok(switch)
    }

    /// Stop `model` when `release_idle` is set and no session uses it.
    pub async fn release_if_idle(&self, model: &str) {
        if !self.config.supervisor.release_idle || self.sessions.active_count_for(model) > 0 {
            return;
        }
        if let Some(outcome) = self.supervisor.stop_model_if_current(model).await {
            info!(model, ?outcome, "released idle model");
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        if rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Where and what to serve.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub listen: SocketAddr,
    pub socket: Option<PathBuf>,
    pub preload: Option<String>,
}

impl ServeOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let listen = config
            .server
            .listen
            .parse()
            .map_err(|e| LivescribeError::ConfigInvalidValue {
                key: "server.listen".to_string(),
                message: format!("{e}"),
            })?;
        Ok(Self {
            listen,
            socket: config.server.socket.clone(),
            preload: config.models.preload.clone(),
        })
    }
}

/// Run until SIGINT, SIGTERM or a control-socket shutdown.
pub async fn run_server(state: Arc<AppState>, options: ServeOptions) -> Result<()> {
    if let Some(model) = &options.preload {
        match state.switch_model(model, true).await {
            Ok(_) => info!(model, "preloaded model"),
            Err(e) => warn!(model, error = %e, "preload failed, starting without a model"),
        }
    }

    let listener = TcpListener::bind(options.listen).await?;
    let address = listener.local_addr()?;
    info!(%address, "listening");
    run_with_listener(state, listener, options.socket).await
}

/// Serve on an already bound listener.
pub async fn run_with_listener(
    state: Arc<AppState>,
    listener: TcpListener,
    socket: Option<PathBuf>,
) -> Result<()> {
    let sweeper = tokio::spawn(sweep_sessions(Arc::clone(&state)));

    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);
    let ipc = Arc::new(IpcServer::new(socket_path));
    let ipc_task = {
        let ipc = Arc::clone(&ipc);
        let handler = ControlHandler::new(Arc::clone(&state));
        tokio::spawn(async move { ipc.start(handler).await })
    };
    info!(socket = %ipc.socket_path().display(), "control socket ready");

    let app = http::router(Arc::clone(&state));
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                res = wait_for_sigterm() => match res {
                    Ok(()) => info!("received SIGTERM, shutting down"),
                    Err(e) => error!(error = %e, "signal handler failed"),
                },
                _ = shutdown_state.shutdown_requested() => info!("shutdown requested"),
            }
            shutdown_state.request_shutdown();
        })
        .await?;

    sweeper.abort();
    if let Err(e) = ipc.stop().await {
        warn!(error = %e, "control socket cleanup failed");
    }
    match ipc_task.await {
        Ok(Err(e)) => warn!(error = %e, "control socket stopped with error"),
        Err(e) => warn!(error = %e, "control socket task failed"),
        Ok(Ok(())) => {}
    }
    if let Some(outcome) = state.supervisor.stop_current_model().await {
        info!(?outcome, "worker stopped on shutdown");
    }
    info!("server stopped");
    Ok(())
}

async fn sweep_sessions(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.session.sweep_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        state.sessions.delete_expired();
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| LivescribeError::Other(format!("Failed to register SIGTERM handler: {e}")))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await
}
