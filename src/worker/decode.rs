//! Decode state held by a worker, one variant per workflow.
//!
//! A worker owns exactly one [`DecodeState`], so it services a single audio
//! stream at a time. The variant is picked from the model's workflow when
//! the worker starts.

use crate::audio::calculate_rms;
use crate::defaults;
use crate::error::{LivescribeError, Result};
use crate::models::catalog::{artifact_path, Backend, ModelDescriptor, Workflow};
use crate::stt::{MockRecognizer, MockTranscriber, StreamingRecognizer, Transcriber};
use std::path::Path;
use tracing::{debug, warn};

/// Minimum RMS for a buffer to be worth a decode pass.
///
/// Far below the silence threshold so only truly silent buffers are skipped.
pub const MIN_ENERGY_FOR_TRANSCRIPTION: f32 = 0.001;

/// A decoded segment before it is tagged with model and session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypothesis {
    pub text: String,
    pub is_final: bool,
}

impl Hypothesis {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// When the buffered workflow runs a decode pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPolicy {
    pub min_ms: u64,
    pub max_ms: u64,
    pub silence_window_ms: u64,
    pub silence_threshold: f32,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            min_ms: defaults::BUFFER_MIN_MS,
            max_ms: defaults::BUFFER_MAX_MS,
            silence_window_ms: defaults::SILENCE_WINDOW_MS,
            silence_threshold: defaults::SILENCE_THRESHOLD,
        }
    }
}

/// Incremental decode: partials as the hypothesis grows, one final per endpoint.
pub struct StreamingDecode {
    recognizer: Box<dyn StreamingRecognizer>,
    last_partial: String,
}

impl StreamingDecode {
    pub fn new(recognizer: Box<dyn StreamingRecognizer>) -> Self {
        Self {
            recognizer,
            last_partial: String::new(),
        }
    }

    pub fn accept(&mut self, samples: &[i16]) -> Result<Vec<Hypothesis>> {
        self.recognizer.accept_waveform(samples)?;
        while self.recognizer.is_ready() {
            self.recognizer.decode()?;
        }

        let text = self.recognizer.hypothesis();
        if self.recognizer.is_endpoint() {
            self.reset();
            let text = text.trim();
            if text.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![Hypothesis::finished(text)]);
        }

        if !text.is_empty() && text != self.last_partial {
            self.last_partial.clone_from(&text);
            return Ok(vec![Hypothesis::partial(text)]);
        }
        Ok(Vec::new())
    }

    /// Close the current utterance early.
    pub fn flush(&mut self) -> Vec<Hypothesis> {
        let text = self.recognizer.hypothesis();
        self.reset();
        let text = text.trim();
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Hypothesis::finished(text)]
        }
    }

    pub fn reset(&mut self) {
        self.recognizer.reset();
        self.last_partial.clear();
    }
}

/// Batch decode over a rolling buffer.
pub struct BufferedDecode {
    transcriber: Box<dyn Transcriber>,
    policy: BufferPolicy,
    sample_rate: u32,
    buffer: Vec<i16>,
}

impl BufferedDecode {
    pub fn new(transcriber: Box<dyn Transcriber>, policy: BufferPolicy, sample_rate: u32) -> Self {
        Self {
            transcriber,
            policy,
            sample_rate,
            buffer: Vec::new(),
        }
    }

    pub fn buffered_ms(&self) -> u64 {
        self.buffer.len() as u64 * 1000 / self.sample_rate.max(1) as u64
    }

    pub fn accept(&mut self, samples: &[i16]) -> Result<Vec<Hypothesis>> {
        self.buffer.extend_from_slice(samples);
        let buffered = self.buffered_ms();

        if buffered >= self.policy.max_ms {
            let is_final = self.trailing_silence();
            return self.decode_pass(is_final);
        }
        if buffered >= self.policy.min_ms && self.trailing_silence() {
            return self.decode_pass(true);
        }
        Ok(Vec::new())
    }

    pub fn flush(&mut self) -> Result<Vec<Hypothesis>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        self.decode_pass(true)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn trailing_silence(&self) -> bool {
        let window = (self.sample_rate as u64 * self.policy.silence_window_ms / 1000) as usize;
        if window == 0 || self.buffer.len() < window {
            return false;
        }
        calculate_rms(&self.buffer[self.buffer.len() - window..]) < self.policy.silence_threshold
    }

    // The buffer is taken before decoding so a failing pass cannot wedge it.
    fn decode_pass(&mut self, is_final: bool) -> Result<Vec<Hypothesis>> {
        let audio = std::mem::take(&mut self.buffer);
        let energy = calculate_rms(&audio);
        if energy < MIN_ENERGY_FOR_TRANSCRIPTION {
            debug!(energy, samples = audio.len(), "discarding silent buffer");
            return Ok(Vec::new());
        }

        let text = self.transcriber.transcribe(&audio)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Hypothesis {
            text: text.to_string(),
            is_final,
        }])
    }
}

/// The decode state of one worker.
pub enum DecodeState {
    Streaming(StreamingDecode),
    Buffered(BufferedDecode),
    /// Model could not be loaded; audio is ignored.
    Unloaded { reason: String },
}

impl std::fmt::Debug for DecodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("Streaming"),
            Self::Buffered(b) => write!(f, "Buffered({}ms)", b.buffered_ms()),
            Self::Unloaded { reason } => write!(f, "Unloaded({reason})"),
        }
    }
}

impl DecodeState {
    /// Load the decoder for `model`, degrading to `Unloaded` on failure.
    pub fn load(model: &ModelDescriptor, models_dir: &Path, policy: BufferPolicy) -> Self {
        match Self::try_load(model, models_dir, policy) {
            Ok(state) => state,
            Err(e) => {
                warn!(model = model.id, error = %e, "model unavailable, running degraded");
                Self::Unloaded {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn try_load(model: &ModelDescriptor, models_dir: &Path, policy: BufferPolicy) -> Result<Self> {
        let path = artifact_path(models_dir, model);
        if model.needs_artifact() && !path.exists() {
            return Err(LivescribeError::TranscriptionModelNotFound {
                path: path.display().to_string(),
            });
        }

        match model.workflow {
            Workflow::Streaming => Ok(Self::Streaming(StreamingDecode::new(
                streaming_recognizer(model, &path, policy)?,
            ))),
            Workflow::Buffered => Ok(Self::Buffered(BufferedDecode::new(
                batch_transcriber(model, &path)?,
                policy,
                model.sample_rate,
            ))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, Self::Unloaded { .. })
    }

    pub fn accept(&mut self, samples: &[i16]) -> Result<Vec<Hypothesis>> {
        match self {
            Self::Streaming(s) => s.accept(samples),
            Self::Buffered(b) => b.accept(samples),
            Self::Unloaded { .. } => Ok(Vec::new()),
        }
    }

    pub fn flush(&mut self) -> Result<Vec<Hypothesis>> {
        match self {
            Self::Streaming(s) => Ok(s.flush()),
            Self::Buffered(b) => b.flush(),
            Self::Unloaded { .. } => Ok(Vec::new()),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Streaming(s) => s.reset(),
            Self::Buffered(b) => b.reset(),
            Self::Unloaded { .. } => {}
        }
    }
}

fn unsupported(model: &ModelDescriptor) -> LivescribeError {
    LivescribeError::Transcription {
        message: format!(
            "backend {:?} cannot serve the {:?} workflow of '{}'",
            model.backend, model.workflow, model.id
        ),
    }
}

fn streaming_recognizer(
    model: &ModelDescriptor,
    path: &Path,
    policy: BufferPolicy,
) -> Result<Box<dyn StreamingRecognizer>> {
    match model.backend {
        Backend::Loopback => Ok(Box::new(
            MockRecognizer::new().with_threshold(policy.silence_threshold),
        )),
        Backend::Vosk => vosk_recognizer(model, path),
        Backend::Whisper => Err(unsupported(model)),
    }
}

fn batch_transcriber(model: &ModelDescriptor, path: &Path) -> Result<Box<dyn Transcriber>> {
    match model.backend {
        Backend::Loopback => Ok(Box::new(
            MockTranscriber::new(model.id).with_response(defaults::LOOPBACK_TOKEN),
        )),
        Backend::Whisper => whisper_transcriber(path),
        Backend::Vosk => Err(unsupported(model)),
    }
}

#[cfg(feature = "vosk")]
fn vosk_recognizer(model: &ModelDescriptor, path: &Path) -> Result<Box<dyn StreamingRecognizer>> {
    let recognizer = crate::stt::vosk::VoskRecognizer::load(path, model.sample_rate)?;
    Ok(Box::new(recognizer))
}

#[cfg(not(feature = "vosk"))]
fn vosk_recognizer(_model: &ModelDescriptor, _path: &Path) -> Result<Box<dyn StreamingRecognizer>> {
    Err(LivescribeError::Transcription {
        message: "built without the `vosk` feature".to_string(),
    })
}

#[cfg(feature = "whisper")]
fn whisper_transcriber(path: &Path) -> Result<Box<dyn Transcriber>> {
    use crate::stt::whisper::{WhisperConfig, WhisperTranscriber};
    let transcriber = WhisperTranscriber::new(WhisperConfig {
        model_path: path.to_path_buf(),
        language: None,
        threads: None,
    })?;
    Ok(Box::new(transcriber))
}

#[cfg(not(feature = "whisper"))]
fn whisper_transcriber(_path: &Path) -> Result<Box<dyn Transcriber>> {
    Err(LivescribeError::Transcription {
        message: "built without the `whisper` feature".to_string(),
    })
}
