//! livescribe - live transcription server
//!
//! Audio arrives over a WebSocket, is handed to a supervised model worker
//! running in its own process, and transcripts flow back in order.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod models;
pub mod moderation;
pub mod server;
pub mod session;
pub mod store;
pub mod stt;
pub mod worker;

// Engine seams
pub use stt::recognizer::StreamingRecognizer;
pub use stt::transcriber::Transcriber;

// Process supervision
pub use worker::{ModelSupervisor, WorkerLauncher, WorkerProcess, WorkerState};

// Sessions and persistence
pub use moderation::{Classifier, ModerationRelay};
pub use session::SessionRegistry;
pub use store::TranscriptStore;

// Error handling
pub use error::{LivescribeError, Result};

// Config
pub use config::Config;

/// Crate version, suffixed with `+<short hash>` when built from a git checkout.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{version}+{hash}"),
        _ => version.to_string(),
    }
}
