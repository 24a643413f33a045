//! PII vault: scrub-before-send and rehydrate-after-receive.
//!
//! Detected PII is replaced with `⟦KIND:N⟧` tokens before any text leaves
//! the process; originals are stored encrypted and can be substituted back
//! into model output. Detection itself is a port — the built-in
//! [`RegexDetector`] covers the structured kinds (phone, email, card,
//! national id); an external NER implementation plugs in for names.

pub mod crypto;
pub mod detector;
pub mod store;

mod scrub;

pub use crypto::{Cipher, EncryptedValue};
pub use detector::{PiiDetector, PiiKind, PiiSpan, RegexDetector};
pub use scrub::{ScrubOutcome, Vault};
pub use store::{BindingStore, MemoryBindingStore, PiiBinding};

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("encryption key is not valid base64-encoded 32 bytes")]
    InvalidKey,

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("binding store failure: {0}")]
    Store(String),
}

impl From<VaultError> for deskrail_core::StageError {
    fn from(err: VaultError) -> Self {
        match err {
            // A bad key or cipher failure will not improve on retry.
            VaultError::InvalidKey | VaultError::Crypto(_) => {
                deskrail_core::StageError::permanent(format!("vault: {err}"))
            }
            // Binding persistence shares the relational store's fate.
            VaultError::Store(msg) => {
                deskrail_core::StageError::fatal(format!("vault store: {msg}"))
            }
        }
    }
}
