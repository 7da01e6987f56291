//! Deterministic, dependency-free analyzer.
//!
//! Model:
//! - Lowercase word tokens are scored against small positive/negative lexicons.
//! - Score is `(pos - neg) / (pos + neg)`; `|score| < threshold` reads as neutral.
//! - Intent is the first keyword group that matches, else `question` for a `?`,
//!   else `general`.
//! - Language is the stop-word set with the most hits (ties and zero hits → `en`).
//! - Suggested replies are the canned answers of the intent, at most [`MAX_REPLIES`].

use async_trait::async_trait;

use courier_messaging::Sentiment;

use crate::analyzer::{AnalysisContext, MessageAnalyzer};
use crate::result::{AiError, Analysis};

const POSITIVE: &[&str] = &[
    "thanks", "thank", "great", "good", "love", "awesome", "excellent", "perfect", "happy",
    "amazing", "nice", "gracias", "obrigado", "merci",
];

const NEGATIVE: &[&str] = &[
    "bad", "terrible", "awful", "hate", "angry", "broken", "worst", "problem", "issue", "wrong",
    "late", "refund", "disappointed", "never",
];

const INTENTS: &[(&str, &[&str])] = &[
    ("cancellation", &["cancel", "unsubscribe", "stop"]),
    ("complaint", &["complaint", "terrible", "worst", "broken", "refund"]),
    ("purchase", &["buy", "order", "price", "cost", "purchase"]),
    ("support", &["help", "support", "problem", "issue", "error"]),
    ("greeting", &["hi", "hello", "hey", "hola", "bonjour", "ola"]),
];

const STOP_WORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "is", "you", "my", "to", "it"]),
    ("es", &["el", "la", "que", "de", "y", "por", "gracias", "hola"]),
    ("pt", &["o", "que", "não", "obrigado", "você", "olá"]),
    ("fr", &["le", "les", "et", "est", "je", "merci", "bonjour"]),
];

const SUMMARY_LEN: usize = 120;

pub const MAX_REPLIES: usize = 3;

const GENERAL_REPLIES: &[&str] = &[
    "Thank you for reaching out. How can I assist you today?",
    "I understand. Let me help you with that.",
    "Could you please provide more details so I can better assist you?",
];

const REPLIES: &[(&str, &[&str])] = &[
    ("cancellation", &[
        "I'm sorry to see you go. Could you tell us why you'd like to cancel?",
        "I can help you with the cancellation. Could you confirm your account details?",
    ]),
    ("complaint", &[
        "I'm sorry about this experience. Let me look into it right away.",
        "Thank you for letting us know. Could you share your order number?",
        "I apologize for the inconvenience. We'll make this right.",
    ]),
    ("purchase", &[
        "Happy to help with your order! Which product are you interested in?",
        "I can share pricing and availability. What would you like to know?",
    ]),
    ("support", &[
        "I'm here to help. Could you describe the problem in a bit more detail?",
        "Thanks for reaching out. Let me check this for you.",
    ]),
    ("greeting", &["Hello! How can I help you today?", "Hi there! What can I do for you?"]),
];

fn replies_for(intent: &str) -> Vec<String> {
    REPLIES
        .iter()
        .find(|(name, _)| *name == intent)
        .map_or(GENERAL_REPLIES, |(_, replies)| *replies)
        .iter()
        .take(MAX_REPLIES)
        .map(|r| r.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct LexiconAnalyzer {
    /// Minimum `|score|` for a non-neutral sentiment.
    threshold: f64,
}

impl Default for LexiconAnalyzer {
    fn default() -> Self {
        Self { threshold: 0.2 }
    }
}

impl LexiconAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn analyze_text(&self, text: &str) -> Result<Analysis, AiError> {
        if !(self.threshold.is_finite() && (0.0..=1.0).contains(&self.threshold)) {
            return Err(AiError::InvalidInput(
                "threshold must be a finite number in [0, 1]".to_string(),
            ));
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(Analysis::neutral());
        }

        let tokens = tokenize(text);
        let count = |lexicon: &[&str]| tokens.iter().filter(|t| lexicon.contains(&t.as_str())).count();

        let pos = count(POSITIVE) as f64;
        let neg = count(NEGATIVE) as f64;
        let score = if pos + neg == 0.0 { 0.0 } else { (pos - neg) / (pos + neg) };
        let sentiment = if score >= self.threshold {
            Sentiment::Positive
        } else if score <= -self.threshold {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        };

        let intent = INTENTS
            .iter()
            .find(|(_, words)| tokens.iter().any(|t| words.contains(&t.as_str())))
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| if text.contains('?') { "question" } else { "general" }.to_string());

        let language = STOP_WORDS
            .iter()
            .map(|(lang, words)| (*lang, tokens.iter().filter(|t| words.contains(&t.as_str())).count()))
            .fold(("en", 0usize), |best, cur| if cur.1 > best.1 { cur } else { best })
            .0
            .to_string();

        let entities = tokens
            .iter()
            .filter(|t| t.len() >= 4 && t.chars().all(|c| c.is_ascii_digit()))
            .cloned()
            .collect();

        let summary = text.chars().take(SUMMARY_LEN).collect::<String>();
        let suggested_replies = replies_for(&intent);

        Ok(Analysis {
            sentiment,
            sentiment_score: score,
            intent,
            language,
            summary: Some(summary),
            entities,
            suggested_replies,
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl MessageAnalyzer for LexiconAnalyzer {
    async fn analyze(&self, text: &str, _context: &AnalysisContext) -> Result<Analysis, AiError> {
        self.analyze_text(text)
    }
}
