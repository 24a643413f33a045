//! Runtime policies: stage concurrency ceilings, retry budgets, scoring
//! weights, relaxation rules, difficulty weights, expansion countries.
//!
//! One immutable [`Policies`] object is read at startup and holds for the
//! life of a batch. Every value has a built-in default matching the product
//! behaviour; a YAML file can override any subset.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::{Sentiment, TicketType};
use crate::error::ConfigError;
use crate::ticket::Segment;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    pub concurrency: ConcurrencyPolicy,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    pub scoring: ScoringPolicy,
    pub routing: RoutingPolicy,
    pub spam: SpamPolicy,
}

impl Policies {
    /// Parse a YAML override file. Unset fields keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Policy(e.to_string()))
    }

    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Policy(format!("{path}: {e}")))?;
        Self::from_yaml(&raw)
    }
}

// ── Concurrency ─────────────────────────────────────────────────────

/// Per-stage ceilings on in-flight external calls across tickets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyPolicy {
    pub llm: usize,
    pub geocode: usize,
    pub spam_llm: usize,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            llm: 5,
            geocode: 10,
            spam_llm: 3,
        }
    }
}

// ── Retry / backoff ─────────────────────────────────────────────────

/// Transient-failure retry budget and capped exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub budget: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction (0.2 = ±20%).
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 2,
            base_delay_ms: 250,
            factor: 2.0,
            max_delay_ms: 4_000,
            jitter_pct: 0.2,
        }
    }
}

// ── Timeouts ────────────────────────────────────────────────────────

/// Per-attempt and per-stage wall-clock timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub llm_attempt_secs: u64,
    pub geocode_attempt_secs: u64,
    pub spam_attempt_secs: u64,
    pub db_write_secs: u64,
    pub llm_wall_secs: u64,
    pub geocode_wall_secs: u64,
    pub spam_wall_secs: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            llm_attempt_secs: 20,
            geocode_attempt_secs: 5,
            spam_attempt_secs: 10,
            db_write_secs: 2,
            llm_wall_secs: 60,
            geocode_wall_secs: 15,
            spam_wall_secs: 30,
        }
    }
}

impl TimeoutPolicy {
    pub fn llm_attempt(&self) -> Duration {
        Duration::from_secs(self.llm_attempt_secs)
    }
    pub fn geocode_attempt(&self) -> Duration {
        Duration::from_secs(self.geocode_attempt_secs)
    }
    pub fn spam_attempt(&self) -> Duration {
        Duration::from_secs(self.spam_attempt_secs)
    }
    pub fn llm_wall(&self) -> Duration {
        Duration::from_secs(self.llm_wall_secs)
    }
    pub fn geocode_wall(&self) -> Duration {
        Duration::from_secs(self.geocode_wall_secs)
    }
    pub fn spam_wall(&self) -> Duration {
        Duration::from_secs(self.spam_wall_secs)
    }
}

// ── Scoring ─────────────────────────────────────────────────────────

/// Weights for the five priority components. The remainder up to 1.0 is
/// reserved headroom and contributes nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub segment: f64,
    pub ticket_type: f64,
    pub sentiment: f64,
    pub age: f64,
    pub repeat: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            segment: 0.30,
            ticket_type: 0.25,
            sentiment: 0.15,
            age: 0.10,
            repeat: 0.07,
        }
    }
}

/// Age bands for the age component. The numeric mapping is deliberately
/// data, not code, so it can be tuned without touching the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeBands {
    /// Ages <= this fall in the young band.
    pub young_max: u8,
    pub young_value: f64,
    pub adult_value: f64,
    /// Ages >= this fall in the senior band.
    pub senior_min: u8,
    pub senior_value: f64,
    pub unknown_value: f64,
}

impl Default for AgeBands {
    fn default() -> Self {
        Self {
            young_max: 24,
            young_value: 0.8,
            adult_value: 0.4,
            senior_min: 60,
            senior_value: 0.9,
            unknown_value: 0.4,
        }
    }
}

/// Everything the priority scorer needs: component tables, weights, extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub weights: ScoreWeights,
    pub age_bands: AgeBands,
    /// Repeat component is min(1, repeat_count / divisor).
    pub repeat_divisor: f64,
    pub fifo_bonus_max: f64,
    pub expansion_bonus: f64,
    pub young_vip_bonus: f64,
    /// Young-VIP bonus applies to ages strictly below this.
    pub young_vip_age_below: u8,
    pub floor: f64,
    pub ceiling: f64,
    pub fraud_floor: f64,
    /// Countries marked strategically prioritised.
    pub expansion_countries: Vec<String>,
    pub home_country: String,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            age_bands: AgeBands::default(),
            repeat_divisor: 5.0,
            fifo_bonus_max: 1.0,
            expansion_bonus: 1.0,
            young_vip_bonus: 1.0,
            young_vip_age_below: 30,
            floor: 1.0,
            ceiling: 10.0,
            fraud_floor: 8.0,
            expansion_countries: Vec::new(),
            home_country: "KZ".to_string(),
        }
    }
}

impl ScoringPolicy {
    pub fn segment_value(&self, segment: Segment) -> f64 {
        match segment {
            Segment::Vip => 1.0,
            Segment::Priority => 0.66,
            Segment::Mass => 0.25,
        }
    }

    pub fn type_value(&self, ticket_type: TicketType) -> f64 {
        match ticket_type {
            TicketType::Fraud => 1.0,
            TicketType::Outage => 0.9,
            TicketType::Claim => 0.7,
            TicketType::DataChange => 0.6,
            TicketType::Complaint => 0.5,
            TicketType::Consultation => 0.2,
            TicketType::Spam => 0.0,
        }
    }

    pub fn sentiment_value(&self, sentiment: Sentiment) -> f64 {
        match sentiment {
            Sentiment::Negative => 1.0,
            Sentiment::Neutral => 0.4,
            Sentiment::Positive => 0.1,
        }
    }

    pub fn age_value(&self, age: Option<u8>) -> f64 {
        match age {
            None => self.age_bands.unknown_value,
            Some(a) if a <= self.age_bands.young_max => self.age_bands.young_value,
            Some(a) if a >= self.age_bands.senior_min => self.age_bands.senior_value,
            Some(_) => self.age_bands.adult_value,
        }
    }

    pub fn repeat_value(&self, repeat_count: u32) -> f64 {
        (f64::from(repeat_count) / self.repeat_divisor).min(1.0)
    }

    pub fn is_expansion_country(&self, country: &str) -> bool {
        !country.eq_ignore_ascii_case(&self.home_country)
            && self
                .expansion_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country))
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// A skill-filter requirement that may be dropped by the relaxation cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relaxable {
    Language,
    Position,
    Vip,
}

impl std::fmt::Display for Relaxable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relaxable::Language => write!(f, "language"),
            Relaxable::Position => write!(f, "position"),
            Relaxable::Vip => write!(f, "VIP"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Geo radius is max(nearest_office_km * radius_slack, min_radius_km).
    pub radius_slack: f64,
    pub min_radius_km: f64,
    /// Requirements dropped in this order until candidates remain.
    pub relaxation_order: Vec<Relaxable>,
    /// Per-type load increments; types not listed weigh 1.
    pub difficulty_weights: HashMap<TicketType, u32>,
    /// Languages that create a matching-skill requirement.
    pub skill_languages: Vec<String>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            radius_slack: 1.5,
            min_radius_km: 50.0,
            relaxation_order: vec![Relaxable::Language, Relaxable::Position, Relaxable::Vip],
            difficulty_weights: HashMap::new(),
            skill_languages: vec!["KZ".to_string(), "EN".to_string()],
        }
    }
}

impl RoutingPolicy {
    pub fn difficulty_for(&self, ticket_type: TicketType) -> u32 {
        self.difficulty_weights.get(&ticket_type).copied().unwrap_or(1)
    }

    pub fn language_needs_skill(&self, language: &str) -> bool {
        self.skill_languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(language))
    }
}

// ── Spam heuristic ──────────────────────────────────────────────────

/// Thresholds for the cheap structural spam layer. Texts scoring at or above
/// `hard_signal_floor` signals are spam without a classifier call; texts with
/// zero signals are clean; everything between is ambiguous and goes to the
/// external classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamPolicy {
    pub min_chars: usize,
    pub invisible_ratio_max: f64,
    pub keywords: Vec<String>,
    pub hard_signal_floor: u32,
}

impl Default for SpamPolicy {
    fn default() -> Self {
        Self {
            min_chars: 30,
            invisible_ratio_max: 0.08,
            keywords: vec![
                "купи".to_string(),
                "скидка".to_string(),
                "выигра".to_string(),
                "приз".to_string(),
                "buy now".to_string(),
                "click here".to_string(),
                "free money".to_string(),
            ],
            hard_signal_floor: 3,
        }
    }
}
