//! Moderation of finalized segments and hand-off to the transcript store.

use crate::config::ModerationConfig;
use crate::error::{LivescribeError, Result};
use crate::store::{NewTranscript, StoredTranscript, TranscriptStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationLabel {
    Clean,
    Offensive,
    Hate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub label: ModerationLabel,
    /// 0.0..=1.0
    pub confidence: f32,
    pub flagged: bool,
    pub keywords: Vec<String>,
}

impl ModerationVerdict {
    pub fn clean() -> Self {
        Self {
            label: ModerationLabel::Clean,
            confidence: 1.0,
            flagged: false,
            keywords: Vec::new(),
        }
    }
}

/// Scores a piece of text. Implementations may block.
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<ModerationVerdict>;
}

/// Case-insensitive keyword matcher.
///
/// Hate terms outrank offensive ones. Confidence grows with the number of
/// distinct matches and saturates at 1.0.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    offensive: Vec<String>,
    hate: Vec<String>,
}

impl KeywordClassifier {
    pub fn new<I, S>(offensive: I, hate: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalize = |terms: I| -> Vec<String> {
            terms
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            offensive: normalize(offensive),
            hate: normalize(hate),
        }
    }

    pub fn from_config(config: &ModerationConfig) -> Self {
        Self::new(config.offensive.iter(), config.hate.iter())
    }

    fn matches<'a>(terms: &'a [String], text: &str) -> Vec<&'a str> {
        terms
            .iter()
            .filter(|term| contains_term(text, term))
            .map(String::as_str)
            .collect()
    }
}

/// Whole-word (or whole-phrase) containment.
fn contains_term(text: &str, term: &str) -> bool {
    text.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Result<ModerationVerdict> {
        let text = text.to_lowercase();
        let hate = Self::matches(&self.hate, &text);
        let offensive = Self::matches(&self.offensive, &text);

        let (label, hits) = if !hate.is_empty() {
            (ModerationLabel::Hate, hate)
        } else if !offensive.is_empty() {
            (ModerationLabel::Offensive, offensive)
        } else {
            return Ok(ModerationVerdict::clean());
        };

        let confidence = (0.6 + 0.2 * (hits.len() as f32 - 1.0)).min(1.0);
        Ok(ModerationVerdict {
            label,
            confidence,
            flagged: true,
            keywords: hits.into_iter().map(str::to_string).collect(),
        })
    }
}

/// A finalized segment on its way to moderation and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalSegment {
    pub session_id: String,
    pub model_id: String,
    pub text: String,
    pub latency_ms: f64,
}

/// Classifies finalized text off the async runtime and stores it.
#[derive(Clone)]
pub struct ModerationRelay {
    classifier: Option<Arc<dyn Classifier>>,
    store: Arc<dyn TranscriptStore>,
}

impl ModerationRelay {
    pub fn new(classifier: Arc<dyn Classifier>, store: Arc<dyn TranscriptStore>) -> Self {
        Self {
            classifier: Some(classifier),
            store,
        }
    }

    /// Store segments without classifying them.
    pub fn without_moderation(store: Arc<dyn TranscriptStore>) -> Self {
        Self {
            classifier: None,
            store,
        }
    }

    pub fn from_config(config: &ModerationConfig, store: Arc<dyn TranscriptStore>) -> Self {
        if config.enabled {
            Self::new(Arc::new(KeywordClassifier::from_config(config)), store)
        } else {
            Self::without_moderation(store)
        }
    }

    pub fn store(&self) -> &Arc<dyn TranscriptStore> {
        &self.store
    }

    /// Classify and persist one segment.
    ///
    /// A failing classifier does not lose the transcript: it is stored
    /// without a label.
    pub async fn finalize(&self, segment: FinalSegment) -> Result<(StoredTranscript, Option<ModerationVerdict>)> {
        let verdict = match &self.classifier {
            Some(classifier) => {
                let classifier = Arc::clone(classifier);
                let text = segment.text.clone();
                let outcome = tokio::task::spawn_blocking(move || classifier.classify(&text))
                    .await
                    .map_err(|e| LivescribeError::Moderation {
                        message: format!("classifier task failed: {e}"),
                    })
                    .and_then(|verdict| verdict);
                match outcome {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!(session = %segment.session_id, error = %e, "moderation failed, storing unlabeled");
                        None
                    }
                }
            }
            None => None,
        };

        let stored = self
            .store
            .save(NewTranscript {
                session_id: segment.session_id,
                model_id: segment.model_id,
                text: segment.text,
                latency_ms: segment.latency_ms,
                moderation: verdict.clone(),
            })
            .await?;
        debug!(id = %stored.id, flagged = stored.flagged, "transcript stored");
        Ok((stored, verdict))
    }
}
