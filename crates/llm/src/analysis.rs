use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use deskrail_core::{Sentiment, TicketType};

use crate::provider::{LlmError, LlmProvider, Message};

/// Classification result for one scrubbed ticket description.
///
/// This is the validated shape of the vendor's JSON answer; the orchestrator
/// merges it into the ticket's [`deskrail_core::Analysis`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysis {
    pub detected_type: TicketType,
    pub language: String,
    #[serde(default)]
    pub is_mixed: bool,
    pub sentiment: Sentiment,
    pub sentiment_confidence: f64,
    pub summary: String,
    #[serde(default)]
    pub anomaly_flags: Vec<String>,
}

impl LlmAnalysis {
    /// Schema checks beyond what serde enforces.
    fn validate(mut self) -> Result<Self, LlmError> {
        if !(0.0..=1.0).contains(&self.sentiment_confidence) {
            return Err(LlmError::InvalidResponse(format!(
                "sentiment_confidence out of range: {}",
                self.sentiment_confidence
            )));
        }
        if self.language.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty language label".into()));
        }
        self.language = self.language.trim().to_uppercase();
        Ok(self)
    }
}

/// Sends scrubbed descriptions to an LLM with a structured prompt and
/// validates the JSON that comes back.
pub struct AnalysisGenerator {
    provider: Box<dyn LlmProvider>,
    temperature: f32,
    max_tokens: u32,
}

impl AnalysisGenerator {
    pub fn new(provider: Box<dyn LlmProvider>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            provider,
            temperature,
            max_tokens,
        }
    }

    /// Build from config, creating the appropriate provider.
    pub fn from_config(config: &deskrail_core::config::LlmConfig) -> Result<Self, LlmError> {
        let provider = crate::providers::create_provider(config)?;
        Ok(Self::new(provider, config.temperature, config.max_tokens))
    }

    /// Classify one scrubbed description.
    ///
    /// The text passed here must already be PII-scrubbed; this module never
    /// sees originals.
    pub async fn analyze(&self, scrubbed: &str) -> Result<LlmAnalysis, LlmError> {
        let messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(format!(
                "Classify this support ticket. Respond ONLY with valid JSON, no explanation.\n\n{scrubbed}"
            )),
        ];

        let response = self
            .provider
            .complete(messages, self.temperature, self.max_tokens)
            .await?;

        debug!("LLM response: {}", response);

        let json_str = extract_json(&response);
        let analysis: LlmAnalysis = serde_json::from_str(json_str)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let analysis = analysis.validate()?;

        info!(
            detected_type = %analysis.detected_type,
            language = %analysis.language,
            sentiment = %analysis.sentiment,
            "ticket classified"
        );
        Ok(analysis)
    }
}

const SYSTEM_PROMPT: &str = r#"You classify customer support tickets. Respond with a single JSON object:

{
  "detected_type": one of "complaint" | "data_change" | "consultation" | "claim" | "outage" | "fraud" | "spam",
  "language": primary language code, e.g. "RU", "KZ", "EN",
  "is_mixed": true when the text mixes languages,
  "sentiment": one of "positive" | "neutral" | "negative",
  "sentiment_confidence": number in [0, 1],
  "summary": one-sentence summary in the ticket's language,
  "anomaly_flags": array of strings, empty when nothing stands out
}

Placeholders like ⟦PHONE:1⟧ replace personal data; treat them as opaque values
and copy them verbatim into the summary when referenced.
Respond with ONLY valid JSON, no explanation or markdown."#;

/// Extract JSON from an LLM response, handling markdown code blocks.
pub(crate) fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = trimmed.find("```json") {
        let json_start = start + 7;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    // Handle bare ``` ... ``` blocks
    if let Some(start) = trimmed.find("```") {
        let json_start = start + 3;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    // Fall back to the outermost braces
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return trimmed[start..=end].trim();
        }
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct CannedProvider {
        response: String,
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn complete(
            &self,
            _messages: Vec<Message>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, LlmError> {
            Ok(self.response.clone())
        }
    }

    fn generator(response: &str) -> AnalysisGenerator {
        AnalysisGenerator::new(
            Box::new(CannedProvider {
                response: response.to_string(),
            }),
            0.1,
            512,
        )
    }

    const VALID: &str = r#"{
        "detected_type": "outage",
        "language": "ru",
        "is_mixed": false,
        "sentiment": "negative",
        "sentiment_confidence": 0.92,
        "summary": "Не работает интернет.",
        "anomaly_flags": []
    }"#;

    #[tokio::test]
    async fn parses_valid_response() {
        let analysis = generator(VALID).analyze("нет интернета").await.unwrap();
        assert_eq!(analysis.detected_type, TicketType::Outage);
        assert_eq!(analysis.language, "RU"); // normalized to uppercase
        assert_eq!(analysis.sentiment, Sentiment::Negative);
    }

    #[tokio::test]
    async fn parses_fenced_response() {
        let fenced = format!("Here you go:\n```json\n{VALID}\n```");
        let analysis = generator(&fenced).analyze("нет интернета").await.unwrap();
        assert_eq!(analysis.detected_type, TicketType::Outage);
    }

    #[tokio::test]
    async fn rejects_unknown_type() {
        let bad = VALID.replace("outage", "mystery");
        let err = generator(&bad).analyze("x").await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn rejects_out_of_range_confidence() {
        let bad = VALID.replace("0.92", "1.7");
        let err = generator(&bad).analyze("x").await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn rejects_non_json() {
        let err = generator("I cannot help with that.").analyze("x").await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(extract_json("noise {\"a\":1} trailing"), r#"{"a":1}"#);
    }
}
