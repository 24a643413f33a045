use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use deskrail_core::{BatchId, BatchStatus};

use crate::orchestrator::{BatchInput, Orchestrator, TicketResult};

/// Snapshot for external pollers.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub total: u32,
    pub processed: u32,
    pub spam: u32,
    /// Most recently finished row, while the batch is in flight.
    pub current: Option<String>,
    pub status: BatchStatus,
    pub results: Vec<TicketResult>,
}

impl BatchProgress {
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            total: 0,
            processed: 0,
            spam: 0,
            current: None,
            status: BatchStatus::Pending,
            results: Vec::new(),
        }
    }
}

struct BatchHandle {
    cancel: CancellationToken,
    progress: Arc<RwLock<BatchProgress>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("batch {0} is already registered")]
    DuplicateBatch(BatchId),
}

/// Control surface over the orchestrator: `start`, `cancel`, `progress`.
pub struct PipelineService {
    orchestrator: Arc<Orchestrator>,
    batches: RwLock<HashMap<BatchId, BatchHandle>>,
}

impl PipelineService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Begin processing a batch in the background. Returns immediately.
    pub async fn start(&self, input: BatchInput) -> Result<BatchId, ServiceError> {
        let batch_id = input.batch.id;

        let mut batches = self.batches.write().await;
        if batches.contains_key(&batch_id) {
            return Err(ServiceError::DuplicateBatch(batch_id));
        }
        let cancel = CancellationToken::new();
        let progress = Arc::new(RwLock::new(BatchProgress::new(batch_id)));
        batches.insert(
            batch_id,
            BatchHandle {
                cancel: cancel.clone(),
                progress: progress.clone(),
            },
        );
        drop(batches);

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.run_batch(input, cancel, progress).await {
                Ok(report) => {
                    info!(batch = %batch_id, status = ?report.status, "batch finished");
                }
                Err(e) => {
                    error!(batch = %batch_id, error = %e, "batch aborted");
                }
            }
        });

        Ok(batch_id)
    }

    /// Request cooperative cancellation. Returns false for unknown batches.
    pub async fn cancel(&self, batch_id: BatchId) -> bool {
        let batches = self.batches.read().await;
        match batches.get(&batch_id) {
            Some(handle) => {
                info!(batch = %batch_id, "cancellation requested");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Current progress snapshot, if the batch is known.
    pub async fn progress(&self, batch_id: BatchId) -> Option<BatchProgress> {
        let batches = self.batches.read().await;
        let handle = batches.get(&batch_id)?;
        let progress = handle.progress.read().await.clone();
        Some(progress)
    }
}
