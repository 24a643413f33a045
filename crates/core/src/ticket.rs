use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TicketId = Uuid;
pub type BatchId = Uuid;

/// Customer segment, as tagged in the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Segment {
    Vip,
    Priority,
    Mass,
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Vip => write!(f, "VIP"),
            Segment::Priority => write!(f, "Priority"),
            Segment::Mass => write!(f, "Mass"),
        }
    }
}

/// Optional address fragments as they arrive from the upload.
/// Any subset of fields may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub house: Option<String>,
}

impl Address {
    /// True when no fragment is filled in at all.
    pub fn is_empty(&self) -> bool {
        self.country.is_none()
            && self.region.is_none()
            && self.city.is_none()
            && self.street.is_none()
            && self.house.is_none()
    }
}

/// One support ticket as ingested. Immutable input to the pipeline;
/// analysis and assignment are produced as separate records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub batch_id: BatchId,
    /// Zero-based row index within the uploaded file (FIFO ordering).
    pub row_index: u32,
    pub description: String,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Option<String>,
    pub segment: Segment,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// How many tickets this customer identifier has filed before.
    #[serde(default)]
    pub repeat_count: u32,
}

impl Ticket {
    /// Age as given, falling back to a birth-date calculation.
    pub fn effective_age(&self) -> Option<u8> {
        if self.age.is_some() {
            return self.age;
        }
        let birth = self.birth_date?;
        let today = Utc::now().date_naive();
        let mut years = today.year() - birth.year();
        if (today.month(), today.day()) < (birth.month(), birth.day()) {
            years -= 1;
        }
        u8::try_from(years.max(0)).ok()
    }
}

/// Agent seniority. Some ticket types require a specific position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Specialist,
    Lead,
    Chief,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Position::Specialist => write!(f, "specialist"),
            Position::Lead => write!(f, "lead"),
            Position::Chief => write!(f, "chief"),
        }
    }
}

/// A human agent that tickets can be routed to.
///
/// Committed load is deliberately NOT a field here — it lives in the load
/// ledger so that concurrent routing sees one serialized view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub full_name: String,
    pub position: Position,
    /// Free-form skill tags ("VIP", "KZ", "EN", "fraud", ...).
    #[serde(default)]
    pub skills: Vec<String>,
    /// Positive multiplier used as a tie-breaker in selection.
    pub skill_factor: f64,
    pub office_id: String,
    /// Stress score in [0, 1].
    #[serde(default)]
    pub stress: f64,
    pub active: bool,
}

impl Agent {
    pub fn has_skill(&self, tag: &str) -> bool {
        self.skills.iter().any(|s| s.eq_ignore_ascii_case(tag))
    }
}

/// WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// A physical office agents work from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Office {
    pub id: String,
    pub name: String,
    pub address: String,
    pub location: GeoPoint,
}

/// Lifecycle state of one uploaded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// One uploaded file worth of tickets, processed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub filename: String,
    pub total_rows: u32,
    pub status: BatchStatus,
}

impl Batch {
    pub fn new(filename: impl Into<String>, total_rows: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            total_rows,
            status: BatchStatus::Pending,
        }
    }
}
