use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use deskrail_core::{BatchId, Stage, StageError, StageOutcome, TicketId};

/// Durable per-ticket stage status, for recovery and external polling.
///
/// Writes are best-effort idempotent upserts keyed (ticket, stage):
/// in-progress rows may be overwritten, terminal rows (completed/failed)
/// are sticky and never regress. Errors from implementations are fatal —
/// an unreachable store terminates the batch.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn record(&self, outcome: StageOutcome) -> Result<(), StageError>;

    async fn get(
        &self,
        ticket_id: TicketId,
        stage: Stage,
    ) -> Result<Option<StageOutcome>, StageError>;

    async fn by_batch(&self, batch_id: BatchId) -> Result<Vec<StageOutcome>, StageError>;
}

/// In-memory progress store for tests and single-process runs. The
/// relational implementation lives with the schema, behind the same trait.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    outcomes: RwLock<HashMap<(TicketId, Stage), StageOutcome>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn record(&self, outcome: StageOutcome) -> Result<(), StageError> {
        let mut outcomes = self.outcomes.write().await;
        let key = (outcome.ticket_id, outcome.stage);
        if let Some(existing) = outcomes.get(&key) {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }
        outcomes.insert(key, outcome);
        Ok(())
    }

    async fn get(
        &self,
        ticket_id: TicketId,
        stage: Stage,
    ) -> Result<Option<StageOutcome>, StageError> {
        let outcomes = self.outcomes.read().await;
        Ok(outcomes.get(&(ticket_id, stage)).cloned())
    }

    async fn by_batch(&self, batch_id: BatchId) -> Result<Vec<StageOutcome>, StageError> {
        let outcomes = self.outcomes.read().await;
        let mut rows: Vec<StageOutcome> = outcomes
            .values()
            .filter(|o| o.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.started_at);
        Ok(rows)
    }
}
