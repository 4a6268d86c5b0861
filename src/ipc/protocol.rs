//! JSON lines exchanged over the control socket.

use crate::session::Session;
use crate::worker::{StopOutcome, SupervisorStatus};
use serde::{Deserialize, Serialize};

/// Requests from the CLI to a running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Status,
    SwitchModel {
        model: String,
        #[serde(default)]
        keep_sessions: bool,
    },
    StopModel,
    Sessions,
    /// Run the expired-session sweep now.
    Sweep,
    Shutdown,
}

impl Command {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Replies from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Status {
        worker: SupervisorStatus,
        sessions: usize,
        active_sessions: usize,
    },
    Switched {
        previous: Option<String>,
        current: String,
        changed: bool,
    },
    Stopped {
        outcome: Option<StopOutcome>,
    },
    Sessions {
        sessions: Vec<Session>,
    },
    Swept {
        removed: usize,
    },
    Error {
        message: String,
        code: String,
    },
}

impl Response {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
