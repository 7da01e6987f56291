use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_messaging::{Insight, Sentiment};

/// Result of analysing one message.
///
/// This is an insight, not a domain change; it becomes an [`Insight`] once a
/// caller decides to persist it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub sentiment: Sentiment,
    /// In \[-1, 1\].
    pub sentiment_score: f64,
    pub intent: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_replies: Vec<String>,
}

impl Analysis {
    /// The result to use when no analysis is available.
    pub fn neutral() -> Self {
        Self {
            sentiment: Sentiment::Neutral,
            sentiment_score: 0.0,
            intent: "unknown".to_string(),
            language: "en".to_string(),
            summary: None,
            entities: Vec::new(),
            suggested_replies: Vec::new(),
        }
    }

    pub fn is_neutral(&self) -> bool {
        *self == Self::neutral()
    }

    pub fn into_insight(self, analyzed_at: DateTime<Utc>) -> Insight {
        Insight {
            sentiment: self.sentiment,
            sentiment_score: self.sentiment_score.clamp(-1.0, 1.0),
            intent: self.intent,
            language: self.language,
            summary: self.summary,
            entities: self.entities,
            suggested_replies: self.suggested_replies,
            analyzed_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("analysis unavailable: {0}")]
    Unavailable(String),

    #[error("analysis timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}
