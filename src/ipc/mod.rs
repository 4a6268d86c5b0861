//! Local control socket used by the CLI to talk to a running server.

pub mod client;
pub mod control;
pub mod protocol;
pub mod server;

pub use client::send_command;
pub use protocol::{Command, Response};
pub use server::{CommandHandler, IpcServer};
