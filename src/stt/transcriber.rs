use crate::error::{LivescribeError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Batch speech-to-text over a complete audio buffer.
///
/// Backs the buffered workflow: one call per decode pass, audio as 16-bit
/// PCM mono at the model's sample rate.
pub trait Transcriber: Send + Sync {
    /// Transcribe audio samples to text.
    fn transcribe(&self, audio: &[i16]) -> Result<String>;

    /// Get the name of the loaded model
    fn model_name(&self) -> &str;

    /// Check if the transcriber is ready
    fn is_ready(&self) -> bool;
}

/// Mock transcriber for tests and the loopback models
#[derive(Debug)]
pub struct MockTranscriber {
    model_name: String,
    response: String,
    should_fail: bool,
    fail_on_call: Option<usize>,
    calls: AtomicUsize,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcription".to_string(),
            should_fail: false,
            fail_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Configure the mock to return a specific response
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to fail on every transcribe
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Fail only the `n`th call (zero-based)
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Number of transcribe calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, _audio: &[i16]) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail || self.fail_on_call == Some(call) {
            Err(LivescribeError::Transcription {
                message: "mock transcription failure".to_string(),
            })
        } else {
            Ok(self.response.clone())
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}
