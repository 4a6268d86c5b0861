//! Unix socket control server: one JSON command line in, one response out.

use crate::error::{LivescribeError, Result};
use crate::ipc::protocol::{Command, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Response;
}

pub struct IpcServer {
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            socket_path,
            shutdown,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// `$XDG_RUNTIME_DIR/livescribe.sock`, else `/tmp/livescribe-<uid>.sock`.
    pub fn default_socket_path() -> PathBuf {
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) => PathBuf::from(dir).join("livescribe.sock"),
            None => {
                // SAFETY: getuid has no preconditions and cannot fail.
                let uid = unsafe { libc::getuid() };
                PathBuf::from(format!("/tmp/livescribe-{uid}.sock"))
            }
        }
    }

    /// Accept connections until [`stop`](Self::stop) is called.
    pub async fn start<H>(&self, handler: H) -> Result<()>
    where
        H: CommandHandler + 'static,
    {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| LivescribeError::IpcSocket {
                message: format!("Failed to remove stale socket: {e}"),
            })?;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| LivescribeError::IpcSocket {
            message: format!("Failed to bind {}: {e}", self.socket_path.display()),
        })?;

        let handler = Arc::new(handler);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(|e| LivescribeError::IpcConnection {
                        message: format!("Failed to accept connection: {e}"),
                    })?;
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            warn!(error = %e, "control client failed");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("control socket loop ended");
        Ok(())
    }

    /// Stop accepting and remove the socket file.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| LivescribeError::IpcSocket {
                message: format!("Failed to remove socket file: {e}"),
            })?;
        }
        Ok(())
    }
}

async fn handle_client<H: CommandHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| LivescribeError::IpcConnection {
            message: format!("Failed to read from client: {e}"),
        })?;

    let response = match Command::from_json(line.trim()) {
        Ok(command) => handler.handle(command).await,
        Err(e) => Response::Error {
            message: format!("Failed to parse command: {e}"),
            code: "protocol".to_string(),
        },
    };

    let mut json = response.to_json().map_err(|e| LivescribeError::IpcProtocol {
        message: format!("Failed to serialize response: {e}"),
    })?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| LivescribeError::IpcConnection {
            message: format!("Failed to write to client: {e}"),
        })?;
    writer.flush().await.map_err(|e| LivescribeError::IpcConnection {
        message: format!("Failed to flush writer: {e}"),
    })?;
    Ok(())
}
