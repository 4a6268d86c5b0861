//! Control commands executed against the running server.

use crate::ipc::protocol::{Command, Response};
use crate::ipc::server::CommandHandler;
use crate::server::AppState;
use std::sync::Arc;
use tracing::info;

pub struct ControlHandler {
    state: Arc<AppState>,
}

impl ControlHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl CommandHandler for ControlHandler {
    async fn handle(&self, command: Command) -> Response {
        match command {
            Command::Status => {
                let sessions = self.state.sessions.list();
                let active_sessions = sessions.iter().filter(|s| s.is_active).count();
                Response::Status {
                    worker: self.state.supervisor.status(),
                    sessions: sessions.len(),
                    active_sessions,
                }
            }
            Command::SwitchModel {
                model,
                keep_sessions,
            } => match self.state.switch_model(&model, keep_sessions).await {
                Ok(switch) => Response::Switched {
                    previous: switch.previous,
                    current: switch.current,
                    changed: switch.changed,
                },
                Err(e) => Response::Error {
                    message: e.client_message(),
                    code: e.code().to_string(),
                },
            },
            Command::StopModel => Response::Stopped {
                outcome: self.state.supervisor.stop_current_model().await,
            },
            Command::Sessions => Response::Sessions {
                sessions: self.state.sessions.list(),
            },
            Command::Sweep => Response::Swept {
                removed: self.state.sessions.delete_expired(),
            },
            Command::Shutdown => {
                info!("shutdown requested over control socket");
                self.state.request_shutdown();
                Response::Ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::worker::{WorkerLauncher, WorkerSettings, WorkerState};

    fn handler() -> ControlHandler {
        let config = Config::default();
        let launcher = WorkerLauncher::new("/nonexistent/livescribe", WorkerSettings::from_config(&config));
        ControlHandler::new(Arc::new(AppState::from_config(config, launcher)))
    }

    #[tokio::test]
    async fn test_status_of_idle_server() {
        let handler = handler();
        handler.state.sessions.create("m", 1).unwrap();
        match handler.handle(Command::Status).await {
            Response::Status {
                worker,
                sessions,
                active_sessions,
            } => {
                assert_eq!(worker.state, WorkerState::Idle);
                assert_eq!(sessions, 1);
                assert_eq!(active_sessions, 1);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_model_is_error_response() {
        let response = handler()
            .handle(Command::SwitchModel {
                model: "nope".to_string(),
                keep_sessions: false,
            })
            .await;
        match response {
            Response::Error { code, message } => {
                assert_eq!(code, "unknown_model");
                assert!(message.contains("loopback-streaming"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_without_model() {
        assert_eq!(
            handler().handle(Command::StopModel).await,
            Response::Stopped { outcome: None }
        );
    }

    #[tokio::test]
    async fn test_shutdown_sets_flag() {
        let handler = handler();
        assert_eq!(handler.handle(Command::Shutdown).await, Response::Ok);
        assert!(handler.state.is_shutting_down());
    }
}
