//! Speech-to-text engines behind narrow seams.
//!
//! The worker only ever talks to [`StreamingRecognizer`] and
//! [`Transcriber`]; native engines are opt-in cargo features.

pub mod recognizer;
pub mod transcriber;
#[cfg(feature = "vosk")]
pub mod vosk;
#[cfg(feature = "whisper")]
pub mod whisper;

pub use recognizer::{MockRecognizer, StreamingRecognizer};
pub use transcriber::{MockTranscriber, Transcriber};
