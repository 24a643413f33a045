use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::stage::{Stage, StageStatus};
use crate::ticket::{BatchId, TicketId};

/// One progress event on the bus.
///
/// Serializes to the observer wire shape:
/// `{ticket_id, batch_id, stage, status, field?, data, message?, timestamp}`.
/// Batch-level events carry the nil UUID as `ticket_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub ticket_id: TicketId,
    pub batch_id: BatchId,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    /// Event for one ticket's stage transition.
    pub fn ticket(
        ticket_id: TicketId,
        batch_id: BatchId,
        stage: Stage,
        status: StageStatus,
    ) -> Self {
        Self {
            ticket_id,
            batch_id,
            stage,
            status,
            field: None,
            data: Map::new(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Batch-level event (nil ticket UUID).
    pub fn batch(batch_id: BatchId, status: StageStatus) -> Self {
        Self::ticket(Uuid::nil(), batch_id, Stage::Pipeline, status)
    }

    pub fn is_batch_level(&self) -> bool {
        self.ticket_id.is_nil()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}
