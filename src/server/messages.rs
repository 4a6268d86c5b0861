//! JSON messages of the streaming endpoint.

use crate::error::{LivescribeError, Result};
use crate::moderation::{ModerationLabel, ModerationVerdict};
use crate::worker::WorkerResult;
use serde::{Deserialize, Serialize};

/// Control messages sent by clients as text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Select a model and start streaming.
    Config {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
    },
    /// Resume an existing session instead of creating one.
    StartSession {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
    },
    Reset,
    Flush,
    Stop,
    SwitchModel { model: String },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| LivescribeError::Protocol {
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub text: String,
    pub is_final: bool,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
    pub code: String,
}

/// Events that carry a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ready {
        session_id: String,
        model: String,
    },
    ModelSwitched {
        previous: Option<String>,
        current: String,
    },
    Moderation {
        session_id: String,
        transcript_id: String,
        label: ModerationLabel,
        confidence: f32,
        flagged: bool,
        keywords: Vec<String>,
    },
    Pong {
        timestamp: i64,
    },
}

/// Anything the server writes as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Result(ResultMessage),
    Error(ErrorMessage),
    Event(ServerEvent),
}

impl ServerMessage {
    pub fn error(error: &LivescribeError) -> Self {
        Self::Error(ErrorMessage {
            error: error.client_message(),
            code: error.code().to_string(),
        })
    }

    /// A result, or an error if the worker reported one. The worker's own
    /// error text stays on the server.
    pub fn from_result(result: &WorkerResult) -> Self {
        match &result.error {
            Some(message) => Self::error(&LivescribeError::WorkerRuntime {
                message: message.clone(),
            }),
            None => Self::Result(ResultMessage {
                text: result.text.clone(),
                is_final: result.is_final,
                model: result.model.clone(),
            }),
        }
    }

    pub fn ready(session_id: &str, model: &str) -> Self {
        Self::Event(ServerEvent::Ready {
            session_id: session_id.to_string(),
            model: model.to_string(),
        })
    }

    pub fn model_switched(previous: Option<String>, current: &str) -> Self {
        Self::Event(ServerEvent::ModelSwitched {
            previous,
            current: current.to_string(),
        })
    }

    pub fn moderation(session_id: &str, transcript_id: &str, verdict: ModerationVerdict) -> Self {
        Self::Event(ServerEvent::Moderation {
            session_id: session_id.to_string(),
            transcript_id: transcript_id.to_string(),
            label: verdict.label,
            confidence: verdict.confidence,
            flagged: verdict.flagged,
            keywords: verdict.keywords,
        })
    }

    pub fn pong() -> Self {
        Self::Event(ServerEvent::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
