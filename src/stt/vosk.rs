//! Vosk streaming recognizer.
//!
//! Vosk decodes inside `accept_waveform`, so `is_ready` never asks for an
//! extra decode step; an endpoint is reported when Vosk finalizes an
//! utterance.

use crate::error::{LivescribeError, Result};
use crate::stt::recognizer::StreamingRecognizer;
use std::path::Path;
use vosk::{DecodingState, Model, Recognizer};

pub struct VoskRecognizer {
    // Kept alive for the recognizer's lifetime.
    _model: Model,
    recognizer: Recognizer,
    final_text: Option<String>,
}

impl std::fmt::Debug for VoskRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoskRecognizer")
            .field("finalized", &self.final_text.is_some())
            .finish()
    }
}

impl VoskRecognizer {
    /// Load a Vosk model directory.
    pub fn load(model_dir: &Path, sample_rate: u32) -> Result<Self> {
        if !model_dir.exists() {
            return Err(LivescribeError::TranscriptionModelNotFound {
                path: model_dir.display().to_string(),
            });
        }
        let path = model_dir
            .to_str()
            .ok_or_else(|| LivescribeError::TranscriptionInferenceFailed {
                message: "Invalid UTF-8 in model path".to_string(),
            })?;
        let model = Model::new(path).ok_or_else(|| LivescribeError::TranscriptionInferenceFailed {
            message: format!("Failed to load Vosk model from {path}"),
        })?;
        let recognizer = Recognizer::new(&model, sample_rate as f32).ok_or_else(|| {
            LivescribeError::TranscriptionInferenceFailed {
                message: "Failed to create Vosk recognizer".to_string(),
            }
        })?;

        Ok(Self {
            _model: model,
            recognizer,
            final_text: None,
        })
    }
}

impl StreamingRecognizer for VoskRecognizer {
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<()> {
        let state = self.recognizer.accept_waveform(samples).map_err(|e| {
            LivescribeError::TranscriptionInferenceFailed {
                message: format!("Vosk rejected waveform: {e}"),
            }
        })?;
        match state {
            DecodingState::Finalized => {
                let text = self
                    .recognizer
                    .result()
                    .single()
                    .map(|r| r.text.to_string())
                    .unwrap_or_default();
                self.final_text = Some(text);
                Ok(())
            }
            DecodingState::Running => Ok(()),
            DecodingState::Failed => Err(LivescribeError::TranscriptionInferenceFailed {
                message: "Vosk decoding failed".to_string(),
            }),
        }
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn decode(&mut self) -> Result<()> {
        Ok(())
    }

    fn hypothesis(&mut self) -> String {
        match &self.final_text {
            Some(text) => text.clone(),
            None => self.recognizer.partial_result().partial.to_string(),
        }
    }

    fn is_endpoint(&self) -> bool {
        self.final_text.is_some()
    }

    fn reset(&mut self) {
        self.recognizer.reset();
        self.final_text = None;
    }
}
