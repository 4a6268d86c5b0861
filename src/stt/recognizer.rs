//! Incremental recognizers for the streaming workflow.

use crate::audio::calculate_rms;
use crate::defaults;
use crate::error::{LivescribeError, Result};
use std::collections::VecDeque;

/// A decoder that consumes audio incrementally and exposes a running
/// hypothesis plus an endpoint flag.
///
/// Call order per chunk: `accept_waveform`, then `decode` while
/// `is_ready`, then read `hypothesis` / `is_endpoint`.
pub trait StreamingRecognizer: Send {
    /// Append mono samples at the recognizer's sample rate.
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<()>;

    /// Whether enough audio is pending for another decode step.
    fn is_ready(&self) -> bool;

    /// Run one decode step.
    fn decode(&mut self) -> Result<()>;

    /// Text decoded since the last reset.
    fn hypothesis(&mut self) -> String;

    /// Whether the decoder has detected an utterance boundary.
    fn is_endpoint(&self) -> bool;

    /// Drop all decode state and start a fresh utterance.
    fn reset(&mut self);
}

/// Mock recognizer used by tests and the loopback streaming model.
///
/// Every voiced chunk adds one token; the first silent chunk after speech
/// marks an endpoint.
#[derive(Debug, Clone)]
pub struct MockRecognizer {
    token: String,
    threshold: f32,
    words: Vec<String>,
    pending: VecDeque<bool>,
    endpoint: bool,
    chunks_seen: usize,
    fail_on_chunk: Option<usize>,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self {
            token: defaults::LOOPBACK_TOKEN.to_string(),
            threshold: defaults::SILENCE_THRESHOLD,
            words: Vec::new(),
            pending: VecDeque::new(),
            endpoint: false,
            chunks_seen: 0,
            fail_on_chunk: None,
        }
    }

    /// Token appended per voiced chunk
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = token.to_string();
        self
    }

    /// RMS level separating voiced from silent chunks
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Fail `accept_waveform` for the `n`th chunk (zero-based)
    pub fn failing_on_chunk(mut self, n: usize) -> Self {
        self.fail_on_chunk = Some(n);
        self
    }
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingRecognizer for MockRecognizer {
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<()> {
        let index = self.chunks_seen;
        self.chunks_seen += 1;
        if self.fail_on_chunk == Some(index) {
            return Err(LivescribeError::TranscriptionInferenceFailed {
                message: format!("mock failure on chunk {index}"),
            });
        }
        self.pending.push_back(calculate_rms(samples) >= self.threshold);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.pending.is_empty()
    }

    fn decode(&mut self) -> Result<()> {
        match self.pending.pop_front() {
            Some(true) => self.words.push(self.token.clone()),
            Some(false) if !self.words.is_empty() => self.endpoint = true,
            _ => {}
        }
        Ok(())
    }

    fn hypothesis(&mut self) -> String {
        self.words.join(" ")
    }

    fn is_endpoint(&self) -> bool {
        self.endpoint
    }

    fn reset(&mut self) {
        self.words.clear();
        self.pending.clear();
        self.endpoint = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voiced() -> Vec<i16> {
        vec![8000; 160]
    }

    fn silent() -> Vec<i16> {
        vec![0; 160]
    }

    fn feed(recognizer: &mut MockRecognizer, samples: &[i16]) {
        recognizer.accept_waveform(samples).unwrap();
        while recognizer.is_ready() {
            recognizer.decode().unwrap();
        }
    }

    #[test]
    fn test_voiced_chunks_build_hypothesis() {
        let mut recognizer = MockRecognizer::new().with_token("hi");
        feed(&mut recognizer, &voiced());
        feed(&mut recognizer, &voiced());
        assert_eq!(recognizer.hypothesis(), "hi hi");
        assert!(!recognizer.is_endpoint());
    }

    #[test]
    fn test_silence_after_speech_is_endpoint() {
        let mut recognizer = MockRecognizer::new();
        feed(&mut recognizer, &voiced());
        feed(&mut recognizer, &silent());
        assert!(recognizer.is_endpoint());
        assert_eq!(recognizer.hypothesis(), "speech");
    }

    #[test]
    fn test_silence_alone_is_not_endpoint() {
        let mut recognizer = MockRecognizer::new();
        feed(&mut recognizer, &silent());
        feed(&mut recognizer, &silent());
        assert!(!recognizer.is_endpoint());
        assert_eq!(recognizer.hypothesis(), "");
    }

    #[test]
    fn test_reset_clears_state() {
        let mut recognizer = MockRecognizer::new();
        feed(&mut recognizer, &voiced());
        feed(&mut recognizer, &silent());
        recognizer.reset();
        assert!(!recognizer.is_endpoint());
        assert_eq!(recognizer.hypothesis(), "");
    }

    #[test]
    fn test_injected_failure_only_hits_one_chunk() {
        let mut recognizer = MockRecognizer::new().failing_on_chunk(0);
        assert!(recognizer.accept_waveform(&voiced()).is_err());
        feed(&mut recognizer, &voiced());
        assert_eq!(recognizer.hypothesis(), "speech");
    }
}
