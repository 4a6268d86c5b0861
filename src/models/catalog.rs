//! Catalog of the models a worker can be started with.
//!
//! The table is static: descriptors are immutable for the life of the
//! process and are shared by value between the supervisor, the HTTP layer
//! and the worker command line.

use crate::defaults;
use crate::error::{LivescribeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a model consumes audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    /// Incremental decode; partial hypotheses and one final per endpoint.
    Streaming,
    /// Batch decode over accumulated audio.
    Buffered,
}

/// Inference engine behind a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Vosk,
    Whisper,
    /// Diagnostic engine that needs no artifacts.
    Loopback,
}

impl Backend {
    /// Whether this binary was built with the engine compiled in.
    pub fn is_compiled(self) -> bool {
        match self {
            Self::Vosk => cfg!(feature = "vosk"),
            Self::Whisper => cfg!(feature = "whisper"),
            Self::Loopback => true,
        }
    }
}

/// Expected processing latency, end of audio to result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyRange {
    pub min_ms: u32,
    pub max_ms: u32,
}

/// Static description of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub workflow: Workflow,
    pub backend: Backend,
    pub sample_rate: u32,
    pub latency: LatencyRange,
    /// File or directory under the models dir; empty when none is needed.
    pub artifact: &'static str,
    pub description: &'static str,
}

impl ModelDescriptor {
    pub fn needs_artifact(&self) -> bool {
        !self.artifact.is_empty()
    }
}

pub const MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "vosk-small-en",
        workflow: Workflow::Streaming,
        backend: Backend::Vosk,
        sample_rate: defaults::SAMPLE_RATE,
        latency: LatencyRange {
            min_ms: 50,
            max_ms: 300,
        },
        artifact: "vosk-model-small-en-us-0.15",
        description: "Small English streaming model, low latency",
    },
    ModelDescriptor {
        id: "vosk-en",
        workflow: Workflow::Streaming,
        backend: Backend::Vosk,
        sample_rate: defaults::SAMPLE_RATE,
        latency: LatencyRange {
            min_ms: 100,
            max_ms: 600,
        },
        artifact: "vosk-model-en-us-0.22",
        description: "Large English streaming model",
    },
    ModelDescriptor {
        id: "whisper-base",
        workflow: Workflow::Buffered,
        backend: Backend::Whisper,
        sample_rate: defaults::SAMPLE_RATE,
        latency: LatencyRange {
            min_ms: 800,
            max_ms: 4000,
        },
        artifact: "ggml-base.bin",
        description: "Multilingual Whisper base, buffered",
    },
    ModelDescriptor {
        id: "whisper-small",
        workflow: Workflow::Buffered,
        backend: Backend::Whisper,
        sample_rate: defaults::SAMPLE_RATE,
        latency: LatencyRange {
            min_ms: 1500,
            max_ms: 8000,
        },
        artifact: "ggml-small.bin",
        description: "Multilingual Whisper small, buffered, higher accuracy",
    },
    ModelDescriptor {
        id: "loopback-streaming",
        workflow: Workflow::Streaming,
        backend: Backend::Loopback,
        sample_rate: defaults::SAMPLE_RATE,
        latency: LatencyRange {
            min_ms: 0,
            max_ms: 10,
        },
        artifact: "",
        description: "Diagnostic: one token per voiced chunk, final on silence",
    },
    ModelDescriptor {
        id: "loopback-buffered",
        workflow: Workflow::Buffered,
        backend: Backend::Loopback,
        sample_rate: defaults::SAMPLE_RATE,
        latency: LatencyRange {
            min_ms: 0,
            max_ms: 10,
        },
        artifact: "",
        description: "Diagnostic: one token per buffered voiced segment",
    },
];

/// Lookup over the static model table.
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    models: &'static [ModelDescriptor],
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    pub fn builtin() -> Self {
        Self { models: MODELS }
    }

    /// Resolve a model id, or fail listing the ids that would have worked.
    pub fn resolve(&self, name: &str) -> Result<&'static ModelDescriptor> {
        self.models
            .iter()
            .find(|m| m.id == name)
            .ok_or_else(|| LivescribeError::UnknownModel {
                name: name.to_string(),
                valid: self.ids().join(", "),
            })
    }

    pub fn list(&self) -> &'static [ModelDescriptor] {
        self.models
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.models.iter().map(|m| m.id).collect()
    }
}

/// Location of a model's artifact under `models_dir`.
pub fn artifact_path(models_dir: &Path, model: &ModelDescriptor) -> PathBuf {
    models_dir.join(model.artifact)
}

/// Whether the model could be loaded from `models_dir` by this binary.
pub fn is_available(models_dir: &Path, model: &ModelDescriptor) -> bool {
    model.backend.is_compiled()
        && (!model.needs_artifact() || artifact_path(models_dir, model).exists())
}
