//! Persistence of finished transcripts.

use crate::error::Result;
use crate::moderation::{ModerationLabel, ModerationVerdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// A transcript to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTranscript {
    pub session_id: String,
    pub model_id: String,
    pub text: String,
    pub latency_ms: f64,
    pub moderation: Option<ModerationVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTranscript {
    pub id: String,
    pub session_id: String,
    pub model_id: String,
    pub text: String,
    pub latency_ms: f64,
    pub moderation_label: Option<ModerationLabel>,
    pub confidence: Option<f32>,
    pub flagged: bool,
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`TranscriptStore::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptQuery {
    pub session_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub flagged: Option<bool>,
    pub offset: usize,
    /// `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

impl TranscriptQuery {
    fn matches(&self, t: &StoredTranscript) -> bool {
        self.session_id.as_ref().is_none_or(|id| *id == t.session_id)
            && self.from.is_none_or(|from| t.created_at >= from)
            && self.to.is_none_or(|to| t.created_at <= to)
            && self.flagged.is_none_or(|flagged| t.flagged == flagged)
    }
}

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Persist a transcript and assign it an id.
    async fn save(&self, transcript: NewTranscript) -> Result<StoredTranscript>;

    /// Matching transcripts, newest first.
    async fn query(&self, query: TranscriptQuery) -> Result<Vec<StoredTranscript>>;
}

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    records: Mutex<Vec<StoredTranscript>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn save(&self, transcript: NewTranscript) -> Result<StoredTranscript> {
        let verdict = transcript.moderation;
        let stored = StoredTranscript {
            id: Uuid::new_v4().to_string(),
            session_id: transcript.session_id,
            model_id: transcript.model_id,
            text: transcript.text,
            latency_ms: transcript.latency_ms,
            moderation_label: verdict.as_ref().map(|v| v.label),
            confidence: verdict.as_ref().map(|v| v.confidence),
            flagged: verdict.as_ref().is_some_and(|v| v.flagged),
            keywords: verdict.map(|v| v.keywords).unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stored.clone());
        Ok(stored)
    }

    async fn query(&self, query: TranscriptQuery) -> Result<Vec<StoredTranscript>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let matching = records
            .iter()
            .rev()
            .filter(|t| query.matches(t))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }
}
