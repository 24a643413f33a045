use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use deskrail_core::TicketId;

use crate::crypto::EncryptedValue;
use crate::detector::PiiKind;
use crate::VaultError;

/// One token↔original mapping. The original is encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiBinding {
    pub token: String,
    pub original: EncryptedValue,
    pub kind: PiiKind,
}

/// Persistence port for PII bindings. The relational implementation lives
/// with the schema; the in-memory one below backs tests and single-process
/// runs. Bindings survive until a batch-level purge.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn append(
        &self,
        ticket_id: TicketId,
        bindings: Vec<PiiBinding>,
    ) -> Result<(), VaultError>;

    async fn for_ticket(&self, ticket_id: TicketId) -> Result<Vec<PiiBinding>, VaultError>;

    /// Remove all bindings for the given tickets.
    async fn purge(&self, ticket_ids: &[TicketId]) -> Result<(), VaultError>;
}

/// In-memory binding store.
#[derive(Debug, Default)]
pub struct MemoryBindingStore {
    bindings: RwLock<HashMap<TicketId, Vec<PiiBinding>>>,
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for MemoryBindingStore {
    async fn append(
        &self,
        ticket_id: TicketId,
        bindings: Vec<PiiBinding>,
    ) -> Result<(), VaultError> {
        let mut map = self.bindings.write().await;
        map.entry(ticket_id).or_default().extend(bindings);
        Ok(())
    }

    async fn for_ticket(&self, ticket_id: TicketId) -> Result<Vec<PiiBinding>, VaultError> {
        let map = self.bindings.read().await;
        Ok(map.get(&ticket_id).cloned().unwrap_or_default())
    }

    async fn purge(&self, ticket_ids: &[TicketId]) -> Result<(), VaultError> {
        let mut map = self.bindings.write().await;
        for id in ticket_ids {
            map.remove(id);
        }
        Ok(())
    }
}
