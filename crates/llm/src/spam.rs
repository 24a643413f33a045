use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use deskrail_core::policy::SpamPolicy;

use crate::analysis::extract_json;
use crate::provider::{LlmError, LlmProvider, Message};

/// Spam classifier answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub probability: f64,
}

/// What the cheap structural layer could conclude on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeuristicOutcome {
    /// Enough signals fired to call spam without a model.
    Spam(SpamVerdict),
    /// Nothing suspicious at all.
    Clean(SpamVerdict),
    /// Needs the external classifier.
    Ambiguous,
}

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bhttps?://\S+|\bwww\.\S+").expect("url regex"));

/// Zero-width and BOM characters used to evade keyword filters.
const INVISIBLE: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Structural spam screen: length floor, URL presence, keyword set,
/// invisible-character ratio, punctuation bursts. Signals at or above the
/// configured floor decide spam outright; zero signals decide clean;
/// anything between is ambiguous.
pub struct SpamHeuristic {
    policy: SpamPolicy,
}

impl SpamHeuristic {
    pub fn new(policy: SpamPolicy) -> Self {
        Self { policy }
    }

    pub fn assess(&self, text: &str) -> HeuristicOutcome {
        let trimmed = text.trim();
        let char_count = trimmed.chars().count();
        let lowered = trimmed.to_lowercase();

        let mut signals = 0u32;
        if char_count < self.policy.min_chars {
            signals += 1;
        }
        if URL.is_match(trimmed) {
            signals += 1;
        }
        if self.policy.keywords.iter().any(|k| lowered.contains(k)) {
            signals += 1;
        }
        if char_count > 0 {
            let invisible = trimmed.chars().filter(|c| INVISIBLE.contains(c)).count();
            if invisible as f64 / char_count as f64 > self.policy.invisible_ratio_max {
                signals += 1;
            }
        }
        if trimmed.contains("!!!") || trimmed.contains("???") {
            signals += 1;
        }

        debug!(signals, chars = char_count, "spam heuristic");

        if signals >= self.policy.hard_signal_floor {
            let probability = (0.75 + 0.05 * f64::from(signals)).min(0.99);
            HeuristicOutcome::Spam(SpamVerdict {
                is_spam: true,
                probability,
            })
        } else if signals == 0 {
            HeuristicOutcome::Clean(SpamVerdict {
                is_spam: false,
                probability: 0.05,
            })
        } else {
            HeuristicOutcome::Ambiguous
        }
    }
}

/// Port for the external spam model, invoked only on ambiguous texts.
#[async_trait]
pub trait SpamClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<SpamVerdict, LlmError>;
}

/// LLM-backed spam classifier.
pub struct LlmSpamClassifier {
    provider: Box<dyn LlmProvider>,
    temperature: f32,
}

impl LlmSpamClassifier {
    pub fn new(provider: Box<dyn LlmProvider>) -> Self {
        Self {
            provider,
            temperature: 0.0,
        }
    }
}

const SPAM_PROMPT: &str = r#"You decide whether a customer support ticket is spam
(advertising, scam, bulk nonsense) or a genuine request. Respond with ONLY:

{"is_spam": true|false, "probability": number in [0, 1]}

`probability` is your confidence that the text is spam."#;

#[async_trait]
impl SpamClassifier for LlmSpamClassifier {
    async fn classify(&self, text: &str) -> Result<SpamVerdict, LlmError> {
        let messages = vec![Message::system(SPAM_PROMPT), Message::user(text.to_string())];
        let response = self.provider.complete(messages, self.temperature, 64).await?;

        let verdict: SpamVerdict = serde_json::from_str(extract_json(&response))
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        if !(0.0..=1.0).contains(&verdict.probability) {
            return Err(LlmError::InvalidResponse(format!(
                "probability out of range: {}",
                verdict.probability
            )));
        }
        Ok(verdict)
    }
}
