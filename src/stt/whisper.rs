//! Whisper transcriber for the buffered workflow.
//!
//! Requires the `whisper` feature (and cmake at build time):
//!
//! ```bash
//! cargo build --features whisper
//! ```

use crate::audio::to_f32;
use crate::error::{LivescribeError, Result};
use crate::stt::transcriber::Transcriber;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Configuration for the Whisper transcriber.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Path to the ggml model file
    pub model_path: PathBuf,
    /// Language code; `None` lets Whisper detect it
    pub language: Option<String>,
    /// Inference threads (None = whisper.cpp default)
    pub threads: Option<usize>,
}

pub struct WhisperTranscriber {
    context: Mutex<WhisperContext>,
    config: WhisperConfig,
    model_name: String,
}

impl std::fmt::Debug for WhisperTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTranscriber")
            .field("config", &self.config)
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

impl WhisperTranscriber {
    /// Load a Whisper model.
    ///
    /// # Errors
    /// `TranscriptionModelNotFound` if the file is missing,
    /// `TranscriptionInferenceFailed` if whisper.cpp rejects it.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        // whisper.cpp logs to stdout by default, which is the frame channel.
        LOGGING_HOOKS_INSTALLED.call_once(install_logging_hooks);

        if !config.model_path.exists() {
            return Err(LivescribeError::TranscriptionModelNotFound {
                path: config.model_path.display().to_string(),
            });
        }

        let model_name = config
            .model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let path = config.model_path.to_str().ok_or_else(|| {
            LivescribeError::TranscriptionInferenceFailed {
                message: "Invalid UTF-8 in model path".to_string(),
            }
        })?;
        let context = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| LivescribeError::TranscriptionInferenceFailed {
                message: format!("Failed to load Whisper model: {e}"),
            })?;

        Ok(Self {
            context: Mutex::new(context),
            config,
            model_name,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: &[i16]) -> Result<String> {
        let samples = to_f32(audio);

        let context =
            self.context
                .lock()
                .map_err(|e| LivescribeError::TranscriptionInferenceFailed {
                    message: format!("Failed to acquire context lock: {e}"),
                })?;

        let mut state =
            context
                .create_state()
                .map_err(|e| LivescribeError::TranscriptionInferenceFailed {
                    message: format!("Failed to create Whisper state: {e}"),
                })?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(self.config.language.as_deref());
        if let Some(threads) = self.config.threads {
            params.set_n_threads(threads as i32);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &samples)
            .map_err(|e| LivescribeError::TranscriptionInferenceFailed {
                message: format!("Whisper inference failed: {e}"),
            })?;

        let text: String = state.as_iter().map(|segment| segment.to_string()).collect();
        Ok(text.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_file() {
        let config = WhisperConfig {
            model_path: PathBuf::from("/nonexistent/ggml-base.bin"),
            language: None,
            threads: None,
        };
        match WhisperTranscriber::new(config) {
            Err(LivescribeError::TranscriptionModelNotFound { path }) => {
                assert!(path.contains("ggml-base.bin"));
            }
            other => panic!("Expected TranscriptionModelNotFound, got {other:?}"),
        }
    }
}
