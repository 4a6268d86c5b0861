//! Error types for livescribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LivescribeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Model selection
    #[error("Unknown model '{name}'. Valid models: {valid}")]
    UnknownModel { name: String, valid: String },

    #[error("Model '{model}' is not active")]
    ModelNotActive { model: String },

    // Worker lifecycle
    #[error("Worker for model '{model}' failed to start: {message}")]
    WorkerStartup { model: String, message: String },

    #[error("Worker for model '{model}' did not respond within {timeout_ms}ms")]
    WorkerTimeout { model: String, timeout_ms: u64 },

    #[error("Worker error: {message}")]
    WorkerRuntime { message: String },

    #[error("Worker queue closed for model '{model}'")]
    QueueClosed { model: String },

    #[error("Frame error: {message}")]
    Frame { message: String },

    // Client protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("No model selected: send a config message first")]
    NotConfigured,

    #[error("Invalid audio chunk: {message}")]
    InvalidAudio { message: String },

    // Sessions
    #[error("Session {id} has expired")]
    SessionExpired { id: String },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Invalid session lifetime of {hours}h")]
    InvalidTtl { hours: i64 },

    // Transcription errors
    #[error("Transcription model not found at {path}")]
    TranscriptionModelNotFound { path: String },

    #[error("Transcription inference failed: {message}")]
    TranscriptionInferenceFailed { message: String },

    #[error("Transcription error: {message}")]
    Transcription { message: String },

    // Collaborators
    #[error("Moderation failed: {message}")]
    Moderation { message: String },

    #[error("Transcript store error: {message}")]
    Store { message: String },

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    #[error("IPC connection failed: {message}")]
    IpcConnection { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LivescribeError {
    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigFileNotFound { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigInvalidValue { .. }
            | Self::Config(_) => "config",
            Self::UnknownModel { .. } => "unknown_model",
            Self::ModelNotActive { .. } | Self::QueueClosed { .. } => "model_unavailable",
            Self::WorkerStartup { .. } => "worker_startup",
            Self::WorkerTimeout { .. } => "worker_timeout",
            Self::WorkerRuntime { .. }
            | Self::Transcription { .. }
            | Self::TranscriptionModelNotFound { .. }
            | Self::TranscriptionInferenceFailed { .. } => "worker_runtime",
            Self::Protocol { .. } => "protocol",
            Self::NotConfigured => "not_configured",
            Self::InvalidAudio { .. } => "invalid_audio",
            Self::SessionExpired { .. } => "session_expired",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::InvalidTtl { .. } => "invalid_ttl",
            Self::Moderation { .. } => "moderation",
            Self::Store { .. } => "store",
            Self::IpcSocket { .. } | Self::IpcProtocol { .. } | Self::IpcConnection { .. } => {
                "ipc"
            }
            Self::Frame { .. } | Self::Io(_) | Self::Other(_) => "internal",
        }
    }

    /// Whether the error was caused by the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownModel { .. }
                | Self::Protocol { .. }
                | Self::NotConfigured
                | Self::InvalidAudio { .. }
                | Self::SessionExpired { .. }
                | Self::SessionNotFound { .. }
                | Self::InvalidTtl { .. }
        )
    }

    /// Message safe to show to remote clients.
    ///
    /// Client errors keep their text. Worker failures, parser output and
    /// anything else carrying local diagnostics (paths, OS errors, codec
    /// internals, panic payloads) collapse into fixed messages.
    pub fn client_message(&self) -> String {
        match self {
            Self::Frame { .. }
            | Self::Io(_)
            | Self::Other(_)
            | Self::ConfigFileNotFound { .. }
            | Self::ConfigParse { .. }
            | Self::ConfigInvalidValue { .. }
            | Self::Config(_)
            | Self::IpcSocket { .. }
            | Self::IpcProtocol { .. }
            | Self::IpcConnection { .. }
            | Self::Store { .. } => "internal error".to_string(),
            Self::Protocol { .. } => "malformed message".to_string(),
            Self::WorkerRuntime { .. }
            | Self::Transcription { .. }
            | Self::TranscriptionInferenceFailed { .. } => "failed to process audio chunk".to_string(),
            Self::WorkerStartup { model, .. } => format!("model '{model}' failed to start"),
            Self::TranscriptionModelNotFound { .. } => "model files are not installed".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LivescribeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = LivescribeError::ConfigInvalidValue {
            key: "session.ttl_hours".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for session.ttl_hours: must be positive"
        );
    }

    #[test]
    fn test_unknown_model_display_lists_valid() {
        let error = LivescribeError::UnknownModel {
            name: "bogus".to_string(),
            valid: "a, b".to_string(),
        };
        assert_eq!(error.to_string(), "Unknown model 'bogus'. Valid models: a, b");
        assert_eq!(error.code(), "unknown_model");
        assert!(error.is_client_error());
    }

    #[test]
    fn test_worker_timeout_display() {
        let error = LivescribeError::WorkerTimeout {
            model: "whisper-base".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(
            error.to_string(),
            "Worker for model 'whisper-base' did not respond within 5000ms"
        );
        assert_eq!(error.code(), "worker_timeout");
        assert!(!error.is_client_error());
    }

    #[test]
    fn test_session_errors_display() {
        let expired = LivescribeError::SessionExpired {
            id: "abc".to_string(),
        };
        let missing = LivescribeError::SessionNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(expired.to_string(), "Session abc has expired");
        assert_eq!(missing.to_string(), "Session abc not found");
        assert_eq!(expired.code(), "session_expired");
        assert_eq!(missing.code(), "session_not_found");
    }

    #[test]
    fn test_not_configured_display() {
        let error = LivescribeError::NotConfigured;
        assert_eq!(
            error.to_string(),
            "No model selected: send a config message first"
        );
        assert_eq!(error.code(), "not_configured");
    }

    #[test]
    fn test_model_unavailable_codes() {
        let inactive = LivescribeError::ModelNotActive {
            model: "m".to_string(),
        };
        let closed = LivescribeError::QueueClosed {
            model: "m".to_string(),
        };
        assert_eq!(inactive.code(), "model_unavailable");
        assert_eq!(closed.code(), "model_unavailable");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: LivescribeError = io_error.into();
        assert!(error.to_string().contains("I/O error"));
        assert_eq!(error.code(), "internal");
    }

    #[test]
    fn test_client_message_hides_internals() {
        let io_error: LivescribeError =
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe /run/x closed").into();
        assert_eq!(io_error.client_message(), "internal error");

        let frame = LivescribeError::Frame {
            message: "length prefix 99999999 exceeds limit".to_string(),
        };
        assert_eq!(frame.client_message(), "internal error");

        let startup = LivescribeError::WorkerStartup {
            model: "vosk-small-en".to_string(),
            message: "No such file or directory (os error 2)".to_string(),
        };
        assert_eq!(
            startup.client_message(),
            "model 'vosk-small-en' failed to start"
        );
    }

    #[test]
    fn test_client_message_keeps_client_errors() {
        let audio = LivescribeError::InvalidAudio {
            message: "chunk is empty".to_string(),
        };
        assert_eq!(audio.client_message(), "Invalid audio chunk: chunk is empty");

        let unknown = LivescribeError::UnknownModel {
            name: "bogus".to_string(),
            valid: "a, b".to_string(),
        };
        assert_eq!(unknown.client_message(), unknown.to_string());
    }

    #[test]
    fn test_client_message_hides_parser_and_worker_detail() {
        let protocol = LivescribeError::Protocol {
            message: "expected value at line 1 column 1".to_string(),
        };
        assert_eq!(protocol.client_message(), "malformed message");

        let panicked = LivescribeError::WorkerRuntime {
            message: "decoder panicked: index out of bounds at src/ggml.c:42".to_string(),
        };
        assert_eq!(panicked.client_message(), "failed to process audio chunk");
        assert_eq!(panicked.code(), "worker_runtime");
    }

    #[test]
    fn test_config_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = [").unwrap_err();
        let error: LivescribeError = toml_error.into();
        assert!(error.to_string().starts_with("Configuration error:"));
        assert_eq!(error.code(), "config");
    }

    #[test]
    fn test_other_display() {
        let error = LivescribeError::Other("custom".to_string());
        assert_eq!(error.to_string(), "custom");
    }
}
