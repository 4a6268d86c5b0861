//! Settings handed from the server to each worker on its command line.

use crate::config::Config;
use crate::worker::decode::BufferPolicy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub models_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub buffer: BufferPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models_dir: config.models.resolved_dir(),
            poll_interval_ms: config.worker.poll_interval_ms,
            buffer: BufferPolicy {
                min_ms: config.worker.buffer_min_ms,
                max_ms: config.worker.buffer_max_ms,
                silence_window_ms: config.worker.silence_window_ms,
                silence_threshold: config.worker.silence_threshold,
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Arguments for the `worker` subcommand, minus `--model`.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--models-dir".to_string(),
            self.models_dir.display().to_string(),
            "--poll-ms".to_string(),
            self.poll_interval_ms.to_string(),
            "--buffer-min-ms".to_string(),
            self.buffer.min_ms.to_string(),
            "--buffer-max-ms".to_string(),
            self.buffer.max_ms.to_string(),
            "--silence-window-ms".to_string(),
            self.buffer.silence_window_ms.to_string(),
            "--silence-threshold".to_string(),
            self.buffer.silence_threshold.to_string(),
        ]
    }
}
