use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use deskrail_core::TicketId;

use crate::crypto::Cipher;
use crate::detector::{PiiDetector, PiiKind};
use crate::store::{BindingStore, PiiBinding};
use crate::VaultError;

/// Result of scrubbing one text.
#[derive(Debug, Clone)]
pub struct ScrubOutcome {
    pub text: String,
    pub bindings: Vec<PiiBinding>,
}

/// Token↔original mapping per ticket.
///
/// Tokens have the shape `⟦KIND:N⟧` where `N` is a per-ticket monotone
/// counter per kind, continued across repeated scrubs of the same ticket.
pub struct Vault {
    detector: Box<dyn PiiDetector>,
    store: Arc<dyn BindingStore>,
    cipher: Cipher,
}

impl Vault {
    pub fn new(
        detector: Box<dyn PiiDetector>,
        store: Arc<dyn BindingStore>,
        cipher: Cipher,
    ) -> Self {
        Self {
            detector,
            store,
            cipher,
        }
    }

    /// Replace every detected PII occurrence with a token and persist the
    /// encrypted originals.
    pub async fn scrub(
        &self,
        ticket_id: TicketId,
        text: &str,
    ) -> Result<ScrubOutcome, VaultError> {
        let spans = self.detector.detect(text);
        if spans.is_empty() {
            return Ok(ScrubOutcome {
                text: text.to_string(),
                bindings: Vec::new(),
            });
        }

        // Continue per-kind counters from whatever is already bound.
        let mut counters: HashMap<PiiKind, u32> = HashMap::new();
        for existing in self.store.for_ticket(ticket_id).await? {
            *counters.entry(existing.kind).or_insert(0) += 1;
        }

        let mut scrubbed = String::with_capacity(text.len());
        let mut bindings = Vec::with_capacity(spans.len());
        let mut cursor = 0usize;

        for span in spans {
            let counter = counters.entry(span.kind).or_insert(0);
            *counter += 1;
            let token = format!("⟦{}:{}⟧", span.kind.label(), counter);

            scrubbed.push_str(&text[cursor..span.start]);
            scrubbed.push_str(&token);
            cursor = span.end;

            bindings.push(PiiBinding {
                token,
                original: self.cipher.encrypt(&text[span.start..span.end])?,
                kind: span.kind,
            });
        }
        scrubbed.push_str(&text[cursor..]);

        debug!(ticket = %ticket_id, bindings = bindings.len(), "scrubbed PII");
        self.store.append(ticket_id, bindings.clone()).await?;

        Ok(ScrubOutcome {
            text: scrubbed,
            bindings,
        })
    }

    /// Mask PII without persisting bindings.
    ///
    /// Used where text must leave the process before the scrub stage has
    /// run, e.g. the spam classifier. The mapping is discarded, so masked
    /// text cannot be rehydrated.
    pub fn mask(&self, text: &str) -> String {
        let spans = self.detector.detect(text);
        if spans.is_empty() {
            return text.to_string();
        }

        let mut counters: HashMap<PiiKind, u32> = HashMap::new();
        let mut masked = String::with_capacity(text.len());
        let mut cursor = 0usize;
        for span in spans {
            let counter = counters.entry(span.kind).or_insert(0);
            *counter += 1;
            masked.push_str(&text[cursor..span.start]);
            masked.push_str(&format!("⟦{}:{}⟧", span.kind.label(), counter));
            cursor = span.end;
        }
        masked.push_str(&text[cursor..]);
        masked
    }

    /// Substitute originals back for every token of this ticket present in
    /// `text`. Tokens are replaced longest-first so `⟦PHONE:1⟧` can never
    /// eat the front of `⟦PHONE:10⟧`.
    pub async fn rehydrate(
        &self,
        ticket_id: TicketId,
        text: &str,
    ) -> Result<String, VaultError> {
        let mut bindings = self.store.for_ticket(ticket_id).await?;
        if bindings.is_empty() {
            return Ok(text.to_string());
        }

        bindings.sort_by(|a, b| b.token.len().cmp(&a.token.len()));

        let mut result = text.to_string();
        for binding in &bindings {
            if result.contains(&binding.token) {
                let original = self.cipher.decrypt(&binding.original)?;
                result = result.replace(&binding.token, &original);
            }
        }
        Ok(result)
    }
}
