use crate::defaults;
use crate::error::{LivescribeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    pub moderation: ModerationConfig,
}

/// Network endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the HTTP/WebSocket listener.
    pub listen: String,
    /// Control socket path; `None` uses the runtime-dir default.
    pub socket: Option<PathBuf>,
}

/// Model artifacts and boot behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ModelsConfig {
    /// Root directory holding model artifacts.
    pub dir: Option<PathBuf>,
    /// Model started when the server boots.
    pub preload: Option<String>,
}

/// Worker process supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub stop_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    /// Stop the worker once the last session bound to it goes away.
    pub release_idle: bool,
}

/// Settings forwarded to every worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub buffer_min_ms: u64,
    pub buffer_max_ms: u64,
    pub silence_window_ms: u64,
    pub silence_threshold: f32,
}

/// Session lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_hours: u32,
    pub sweep_interval_secs: u64,
}

/// Keyword moderation of finalized segments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    pub offensive: Vec<String>,
    pub hate: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::LISTEN_ADDR.to_string(),
            socket: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: defaults::STOP_TIMEOUT_MS,
            startup_timeout_ms: defaults::STARTUP_TIMEOUT_MS,
            release_idle: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
            buffer_min_ms: defaults::BUFFER_MIN_MS,
            buffer_max_ms: defaults::BUFFER_MAX_MS,
            silence_window_ms: defaults::SILENCE_WINDOW_MS,
            silence_threshold: defaults::SILENCE_THRESHOLD,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: defaults::SESSION_TTL_HOURS,
            sweep_interval_secs: defaults::SESSION_SWEEP_INTERVAL_SECS,
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offensive: defaults::OFFENSIVE_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hate: defaults::HATE_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl ModelsConfig {
    /// Artifact root, falling back to `$XDG_DATA_HOME/livescribe/models`.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("livescribe")
                .join("models")
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LivescribeError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                LivescribeError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if it doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(LivescribeError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - LIVESCRIBE_LISTEN → server.listen
    /// - LIVESCRIBE_SOCKET → server.socket
    /// - LIVESCRIBE_MODELS_DIR → models.dir
    /// - LIVESCRIBE_PRELOAD → models.preload
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(listen) = std::env::var("LIVESCRIBE_LISTEN")
            && !listen.is_empty()
        {
            self.server.listen = listen;
        }

        if let Ok(socket) = std::env::var("LIVESCRIBE_SOCKET")
            && !socket.is_empty()
        {
            self.server.socket = Some(PathBuf::from(socket));
        }

        if let Ok(dir) = std::env::var("LIVESCRIBE_MODELS_DIR")
            && !dir.is_empty()
        {
            self.models.dir = Some(PathBuf::from(dir));
        }

        if let Ok(model) = std::env::var("LIVESCRIBE_PRELOAD")
            && !model.is_empty()
        {
            self.models.preload = Some(model);
        }

        self
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, message: &str| LivescribeError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.session.ttl_hours == 0 {
            return Err(invalid("session.ttl_hours", "must be at least 1"));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(invalid("session.sweep_interval_secs", "must be positive"));
        }
        if self.supervisor.stop_timeout_ms == 0 {
            return Err(invalid("supervisor.stop_timeout_ms", "must be positive"));
        }
        if self.supervisor.startup_timeout_ms == 0 {
            return Err(invalid("supervisor.startup_timeout_ms", "must be positive"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(invalid("worker.poll_interval_ms", "must be positive"));
        }
        if self.worker.buffer_min_ms > self.worker.buffer_max_ms {
            return Err(invalid(
                "worker.buffer_min_ms",
                "must not exceed worker.buffer_max_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.worker.silence_threshold) {
            return Err(invalid("worker.silence_threshold", "must be within 0.0..=1.0"));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LivescribeError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Default config file location: `$XDG_CONFIG_HOME/livescribe/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livescribe")
            .join("config.toml")
    }
}
