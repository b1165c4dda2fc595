//! Authenticated encryption for cached artifacts
//!
//! Proxy layer sealing everything written to the underlying store with
//! AES-256-GCM. The wire shape is `nonce ‖ ciphertext`; decryption succeeds
//! only while the key is unchanged.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::{ArtifactError, ObjectStore};

/// AES-GCM standard nonce length in bytes.
const NONCE_SIZE: usize = 12;

pub struct Cipher {
    cipher: Aes256Gcm,
    inner: Arc<dyn ObjectStore>,
}

impl Cipher {
    /// `key` must be exactly 32 bytes.
    pub fn new(key: &[u8], inner: Arc<dyn ObjectStore>) -> Result<Self, ArtifactError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| ArtifactError::Cipher("key must be 32 bytes".to_string()))?;
        Ok(Cipher { cipher, inner })
    }
}

#[async_trait]
impl ObjectStore for Cipher {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ArtifactError> {
        let Some(payload) = self.inner.get(key).await? else {
            return Ok(None);
        };

        if payload.len() < NONCE_SIZE {
            return Err(ArtifactError::Cipher(
                "payload smaller than nonce size".to_string(),
            ));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ArtifactError::Cipher("fail to decrypt payload".to_string()))?;
        Ok(Some(Bytes::from(plaintext)))
    }

    async fn put(&self, key: &str, payload: Bytes) -> Result<(), ArtifactError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, payload.as_ref())
            .map_err(|_| ArtifactError::Cipher("fail to encrypt payload".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        self.inner.put(key, Bytes::from(sealed)).await
    }
}
