use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Categories of personally-identifying information the vault tokenizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Phone,
    NationalId,
    Card,
    Email,
    Name,
}

impl PiiKind {
    /// Token label. Labels are distinct and never a prefix of one another,
    /// so tokens of different kinds cannot collide.
    pub fn label(self) -> &'static str {
        match self {
            PiiKind::Phone => "PHONE",
            PiiKind::NationalId => "NATIONAL_ID",
            PiiKind::Card => "CARD",
            PiiKind::Email => "EMAIL",
            PiiKind::Name => "NAME",
        }
    }
}

/// One detected PII occurrence, as byte offsets into the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiSpan {
    pub start: usize,
    pub end: usize,
    pub kind: PiiKind,
}

/// Port for PII detection. Implementations return non-overlapping spans in
/// ascending text order; the vault resolves any overlap by keeping the span
/// that starts first (longer span wins a shared start).
pub trait PiiDetector: Send + Sync {
    fn detect(&self, text: &str) -> Vec<PiiSpan>;
}

static CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").expect("card regex")
});
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+7|\+\d{1,2}|8)[ -]?\(?\d{3}\)?[ -]?\d{3}[ -]?\d{2}[ -]?\d{2}")
        .expect("phone regex")
});
static NATIONAL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{12}\b").expect("national id regex"));
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});

/// Built-in detector for the structured PII kinds. Name detection needs an
/// NER model and is left to an external [`PiiDetector`] implementation.
#[derive(Debug, Default)]
pub struct RegexDetector;

impl RegexDetector {
    pub fn new() -> Self {
        Self
    }
}

impl PiiDetector for RegexDetector {
    fn detect(&self, text: &str) -> Vec<PiiSpan> {
        // National id runs before phone: a 12-digit id starting with 8
        // would otherwise partially match the phone pattern.
        let passes: [(&Regex, PiiKind); 4] = [
            (&CARD, PiiKind::Card),
            (&NATIONAL_ID, PiiKind::NationalId),
            (&PHONE, PiiKind::Phone),
            (&EMAIL, PiiKind::Email),
        ];

        let mut spans: Vec<PiiSpan> = Vec::new();
        for (regex, kind) in passes {
            for m in regex.find_iter(text) {
                let candidate = PiiSpan {
                    start: m.start(),
                    end: m.end(),
                    kind,
                };
                let overlaps = spans
                    .iter()
                    .any(|s| candidate.start < s.end && s.start < candidate.end);
                if !overlaps {
                    spans.push(candidate);
                }
            }
        }

        spans.sort_by_key(|s| s.start);
        spans
    }
}
