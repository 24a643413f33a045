use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ticket::{BatchId, TicketId};

/// One node of the per-ticket pipeline. `Pipeline` is the pseudo-stage used
/// for batch-level events and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SpamFilter,
    PiiScrub,
    LlmAnalysis,
    Geocode,
    Priority,
    Routing,
    Pipeline,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::SpamFilter => "spam_filter",
            Stage::PiiScrub => "pii_scrub",
            Stage::LlmAnalysis => "llm_analysis",
            Stage::Geocode => "geocode",
            Stage::Priority => "priority",
            Stage::Routing => "routing",
            Stage::Pipeline => "pipeline",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Completed and Failed never regress (the progress store enforces this).
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Persisted record of one stage run's state for one ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub ticket_id: TicketId,
    pub batch_id: BatchId,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageOutcome {
    pub fn in_progress(ticket_id: TicketId, batch_id: BatchId, stage: Stage) -> Self {
        Self {
            ticket_id,
            batch_id,
            stage,
            status: StageStatus::InProgress,
            message: None,
            error_detail: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(mut self, status: StageStatus) -> Self {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// The routing decision for one ticket. Exactly one exists per non-spam
/// ticket once the routing stage completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub ticket_id: TicketId,
    pub agent_id: String,
    pub office_id: String,
    /// Human-readable account of distance, enforced and relaxed constraints,
    /// and the chosen agent's load before/after.
    pub explanation: String,
    /// Structured routing detail (relaxation list, distances, loads).
    #[serde(default)]
    pub details: Map<String, Value>,
    pub assigned_at: DateTime<Utc>,
}
