//! Command-line interface for livescribe
//!
//! Provides argument parsing using clap derive macros.

use crate::defaults;
use crate::worker::{BufferPolicy, WorkerSettings};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Live transcription server with hot-swappable model workers
#[derive(Parser, Debug)]
#[command(name = "livescribe", version, about)]
pub struct Cli {
    /// Subcommand to execute (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Control socket path (default: $XDG_RUNTIME_DIR/livescribe.sock)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP/WebSocket server (foreground)
    Serve {
        /// Listen address, e.g. 0.0.0.0:8765
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Model to start before accepting connections
        #[arg(long, value_name = "MODEL")]
        preload: Option<String>,
    },

    /// Show the active model and session counts of a running server
    Status,

    /// Switch the active model of a running server
    Switch {
        /// Model id (see `models list`)
        model: String,

        /// Move active sessions to the new model instead of ending them
        #[arg(long)]
        keep_sessions: bool,
    },

    /// Stop the active model of a running server
    StopModel,

    /// List sessions of a running server
    Sessions,

    /// Remove expired, inactive sessions now
    Sweep,

    /// Ask a running server to shut down
    Shutdown,

    /// Inspect the model catalog
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// Run a model worker on stdin/stdout (spawned by the server)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Model catalog actions
#[derive(Subcommand, Debug)]
pub enum ModelsAction {
    /// List models with install and build status
    List,
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    /// Model id to load
    #[arg(long)]
    pub model: String,

    #[arg(long, value_name = "PATH")]
    pub models_dir: PathBuf,

    #[arg(long, default_value_t = defaults::WORKER_POLL_INTERVAL_MS)]
    pub poll_ms: u64,

    #[arg(long, default_value_t = defaults::BUFFER_MIN_MS)]
    pub buffer_min_ms: u64,

    #[arg(long, default_value_t = defaults::BUFFER_MAX_MS)]
    pub buffer_max_ms: u64,

    #[arg(long, default_value_t = defaults::SILENCE_WINDOW_MS)]
    pub silence_window_ms: u64,

    #[arg(long, default_value_t = defaults::SILENCE_THRESHOLD)]
    pub silence_threshold: f32,
}

impl WorkerArgs {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            models_dir: self.models_dir.clone(),
            poll_interval_ms: self.poll_ms,
            buffer: BufferPolicy {
                min_ms: self.buffer_min_ms,
                max_ms: self.buffer_max_ms,
                silence_window_ms: self.silence_window_ms,
                silence_threshold: self.silence_threshold,
            },
        }
    }
}
