//! Secret decryption.
//!
//! Server and tunnel passwords are stored encrypted with a key derived from the
//! user's master password. The key only lives in memory for the current session, so
//! decryption can fail with [`PgDeckError::CryptKeyMissing`] until the user unlocks.

use crate::error::{PgDeckError, PgDeckResult};
use crate::models::Secret;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Symmetric key used to decrypt stored secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptKey([u8; 32]);

impl CryptKey {
    /// Derive a key from the master password.
    pub fn derive(master_password: &str) -> Self {
        let digest = Sha256::digest(master_password.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptKey(<redacted>)")
    }
}

/// Source of the decryption key and the decryption step itself.
pub trait SecretService: Send + Sync {
    /// The key for this session, if the user has unlocked it.
    fn crypt_key(&self) -> Option<CryptKey>;

    /// Decrypt a secret to text.
    fn decrypt(&self, secret: &Secret, key: &CryptKey) -> PgDeckResult<String>;

    /// Decrypt with the session key, failing with `CryptKeyMissing` when locked.
    fn decrypt_with_session_key(&self, secret: &Secret) -> PgDeckResult<String> {
        let key = self.crypt_key().ok_or(PgDeckError::CryptKeyMissing)?;
        self.decrypt(secret, &key)
    }
}

/// ChaCha20-Poly1305 secrets keyed by a master password.
///
/// Ciphertext layout is `nonce (12 bytes) || sealed bytes`.
#[derive(Debug, Default)]
pub struct MasterKeySecrets {
    key: RwLock<Option<CryptKey>>,
}

impl MasterKeySecrets {
    /// Create a locked instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unlocked instance.
    pub fn with_master_password(master_password: &str) -> Self {
        let secrets = Self::new();
        secrets.set_master_password(master_password);
        secrets
    }

    /// Unlock with the master password.
    pub fn set_master_password(&self, master_password: &str) {
        *self.key.write() = Some(CryptKey::derive(master_password));
        tracing::debug!("Master key set");
    }

    /// Forget the key.
    pub fn clear(&self) {
        *self.key.write() = None;
        tracing::debug!("Master key cleared");
    }

    /// Encrypt text with the session key.
    pub fn encrypt(&self, plaintext: &str) -> PgDeckResult<Secret> {
        let key = self.crypt_key().ok_or(PgDeckError::CryptKeyMissing)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = key
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| PgDeckError::internal("Failed to encrypt secret"))?;

        let mut bytes = Vec::with_capacity(NONCE_LEN + sealed.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&sealed);
        Ok(Secret::from_ciphertext(bytes))
    }
}

impl SecretService for MasterKeySecrets {
    fn crypt_key(&self) -> Option<CryptKey> {
        self.key.read().clone()
    }

    fn decrypt(&self, secret: &Secret, key: &CryptKey) -> PgDeckResult<String> {
        let bytes = secret.ciphertext();
        if bytes.len() < NONCE_LEN {
            return Err(PgDeckError::storage("Stored secret is truncated", None));
        }
        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let plain = key.cipher().decrypt(Nonce::from_slice(nonce), sealed).map_err(|_| {
            PgDeckError::authentication_with_hint(
                "Failed to decrypt stored password",
                "The master password may have changed; re-enter the saved password",
            )
        })?;

        String::from_utf8(plain)
            .map_err(|_| PgDeckError::storage("Decrypted secret is not valid UTF-8", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_then_decrypt() {
        let secrets = MasterKeySecrets::with_master_password("hunter2");
        let secret = secrets.encrypt("s3cret").unwrap();

        assert_ne!(secret.ciphertext(), b"s3cret");
        assert_eq!(secrets.decrypt_with_session_key(&secret).unwrap(), "s3cret");
    }

    #[test]
    fn test_locked_service_reports_missing_key() {
        let secrets = MasterKeySecrets::with_master_password("hunter2");
        let secret = secrets.encrypt("s3cret").unwrap();
        secrets.clear();

        assert!(secrets.crypt_key().is_none());
        assert!(secrets.decrypt_with_session_key(&secret).unwrap_err().is_crypt_key_missing());
        assert!(secrets.encrypt("x").unwrap_err().is_crypt_key_missing());
    }

    #[test]
    fn test_wrong_master_password_fails_cleanly() {
        let secret = MasterKeySecrets::with_master_password("right").encrypt("pw").unwrap();
        let other = MasterKeySecrets::with_master_password("wrong");

        let err = other.decrypt_with_session_key(&secret).unwrap_err();
        assert_eq!(err.category(), "Authentication");
        assert!(other.decrypt_with_session_key(&Secret::from_ciphertext(vec![1])).is_err());
    }
}
