use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ticket categories the analysis stage can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Complaint,
    DataChange,
    Consultation,
    Claim,
    Outage,
    Fraud,
    Spam,
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TicketType::Complaint => "complaint",
            TicketType::DataChange => "data_change",
            TicketType::Consultation => "consultation",
            TicketType::Claim => "claim",
            TicketType::Outage => "outage",
            TicketType::Fraud => "fraud",
            TicketType::Spam => "spam",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        };
        write!(f, "{s}")
    }
}

/// Per-ticket enrichment result.
///
/// Built up across stages: the LLM stage fills classification fields, the
/// priority stage fills the `priority_*` fields. When the LLM stage fails
/// permanently the classification fields keep the documented defaults
/// (consultation / RU / neutral) so downstream stages still run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub detected_type: TicketType,
    /// Primary language label ("RU", "KZ", "EN", ...).
    pub language: String,
    pub is_mixed: bool,
    pub sentiment: Sentiment,
    pub sentiment_confidence: f64,
    pub summary: String,
    #[serde(default)]
    pub anomaly_flags: Vec<String>,
    pub priority_base: f64,
    pub priority_extra: f64,
    pub priority_final: f64,
    #[serde(default)]
    pub priority_breakdown: Map<String, Value>,
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            detected_type: TicketType::Consultation,
            language: "RU".to_string(),
            is_mixed: false,
            sentiment: Sentiment::Neutral,
            sentiment_confidence: 0.0,
            summary: String::new(),
            anomaly_flags: Vec::new(),
            priority_base: 0.0,
            priority_extra: 0.0,
            priority_final: 0.0,
            priority_breakdown: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_partial_failure_contract() {
        let a = Analysis::default();
        assert_eq!(a.detected_type, TicketType::Consultation);
        assert_eq!(a.language, "RU");
        assert_eq!(a.sentiment, Sentiment::Neutral);
        assert_eq!(a.sentiment_confidence, 0.0);
    }

    #[test]
    fn ticket_type_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&TicketType::DataChange).unwrap(),
            "\"data_change\""
        );
        let t: TicketType = serde_json::from_str("\"outage\"").unwrap();
        assert_eq!(t, TicketType::Outage);
    }
}
