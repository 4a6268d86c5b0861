//! Client side of the control socket.

use crate::error::{LivescribeError, Result};
use crate::ipc::protocol::{Command, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send one command to a running server and wait for its reply.
///
/// # Errors
/// `IpcConnection` if the server is not reachable, `IpcProtocol` if the
/// reply cannot be decoded.
pub async fn send_command(socket_path: &Path, command: &Command) -> Result<Response> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| LivescribeError::IpcConnection {
            message: format!("Failed to connect to {}: {e}", socket_path.display()),
        })?;
    let (reader, mut writer) = stream.into_split();

    let mut line = command.to_json().map_err(|e| LivescribeError::IpcProtocol {
        message: format!("Failed to serialize command: {e}"),
    })?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| LivescribeError::IpcConnection {
            message: format!("Failed to write command: {e}"),
        })?;
    writer.flush().await.map_err(|e| LivescribeError::IpcConnection {
        message: format!("Failed to flush command: {e}"),
    })?;

    let mut reply = String::new();
    BufReader::new(reader)
        .read_line(&mut reply)
        .await
        .map_err(|e| LivescribeError::IpcConnection {
            message: format!("Failed to read response: {e}"),
        })?;
    Response::from_json(reply.trim()).map_err(|e| LivescribeError::IpcProtocol {
        message: format!("Failed to deserialize response: {e}"),
    })
}
