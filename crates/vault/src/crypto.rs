use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::VaultError;

/// AES-256-GCM ciphertext with its nonce, both base64 for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub nonce: String,
    pub data: String,
}

/// Per-process symmetric cipher for binding originals at rest.
///
/// The key arrives base64-encoded from configuration and must decode to
/// exactly 32 bytes. It is never logged; the manual `Debug` impl redacts it.
#[derive(Clone)]
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"***").finish()
    }
}

impl Cipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, VaultError> {
        let bytes = B64.decode(encoded).map_err(|_| VaultError::InvalidKey)?;
        if bytes.len() != 32 {
            return Err(VaultError::InvalidKey);
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedValue, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        Ok(EncryptedValue {
            nonce: B64.encode(nonce),
            data: B64.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, value: &EncryptedValue) -> Result<String, VaultError> {
        let nonce_bytes = B64
            .decode(&value.nonce)
            .map_err(|e| VaultError::Crypto(format!("bad nonce: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::Crypto(format!(
                "bad nonce length: {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = B64
            .decode(&value.data)
            .map_err(|e| VaultError::Crypto(format!("bad ciphertext: {e}")))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| VaultError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Cipher {
        Cipher::from_base64_key(&B64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let value = cipher.encrypt("+7 701 123 45 67").unwrap();
        assert_ne!(value.data, "+7 701 123 45 67");
        assert_eq!(cipher.decrypt(&value).unwrap(), "+7 701 123 45 67");
    }

    #[test]
    fn nonces_are_unique_per_encryption() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            Cipher::from_base64_key("not base64 !!!"),
            Err(VaultError::InvalidKey)
        ));
        assert!(matches!(
            Cipher::from_base64_key(&B64.encode([1u8; 16])),
            Err(VaultError::InvalidKey)
        ));
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let value = test_cipher().encrypt("secret").unwrap();
        let other = Cipher::from_base64_key(&B64.encode([9u8; 32])).unwrap();
        assert!(other.decrypt(&value).is_err());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let rendered = format!("{:?}", test_cipher());
        assert!(rendered.contains("***"));
    }
}
