use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use kmsfs_core::kms::{KeyDecryptor, KeyEncryptor, KeyReference, KmsError};
use tracing::instrument;

use crate::key_provider::{KeyMaterial, KeyProvider};

const NONCE_LEN: usize = 12;

/// AES-256-GCM key service over locally held keys.
///
/// Ciphertext layout is `nonce || ciphertext+tag`; the key reference is bound as
/// associated data so a payload only opens under the key it was sealed with.
pub struct LocalKms<P: KeyProvider> {
    key_provider: P,
}

impl<P: KeyProvider> LocalKms<P> {
    pub fn new(key_provider: P) -> Self {
        Self { key_provider }
    }
}

#[async_trait]
impl<P: KeyProvider> KeyEncryptor for LocalKms<P> {
    #[instrument(skip_all, fields(key = %key))]
    async fn encrypt(&self, key: &KeyReference, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let material = self
            .key_provider
            .get_or_create(key)
            .await
            .map_err(|e| KmsError::Backend {
                reason: format!("key provider: {e}"),
            })?;

        let cipher = build_cipher(&material)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = key.to_string();
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| KmsError::Backend {
                reason: format!("encrypt failed: {e}"),
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

#[async_trait]
impl<P: KeyProvider> KeyDecryptor for LocalKms<P> {
    #[instrument(skip_all, fields(key = %key))]
    async fn decrypt(&self, key: &KeyReference, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let material = self
            .key_provider
            .get(key)
            .await
            .map_err(|e| KmsError::Backend {
                reason: format!("key provider: {e}"),
            })?
            .ok_or_else(|| KmsError::KeyNotFound {
                key: key.to_string(),
            })?;

        if ciphertext.len() < NONCE_LEN {
            return Err(KmsError::InvalidCiphertext {
                reason: format!("expected at least {NONCE_LEN} bytes, got {}", ciphertext.len()),
            });
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);

        let cipher = build_cipher(&material)?;
        let aad = key.to_string();
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| KmsError::InvalidCiphertext {
                reason: format!("decrypt failed: {e}"),
            })
    }
}

fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, KmsError> {
    Aes256Gcm::new_from_slice(&material.bytes).map_err(|e| KmsError::Backend {
        reason: format!("cipher init failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    fn key(name: &str) -> KeyReference {
        KeyReference::new("p", "global", "ring", name)
    }

    #[tokio::test]
    async fn round_trip_encrypts_and_decrypts() {
        let kms = LocalKms::new(InMemoryKeyProvider::new());
        let sealed = kms.encrypt(&key("a"), b"hello-kms").await.expect("encrypt");
        assert!(
            !sealed.windows(9).any(|w| w == b"hello-kms"),
            "plaintext must not be stored"
        );

        let opened = kms.decrypt(&key("a"), &sealed).await.expect("decrypt");
        assert_eq!(opened, b"hello-kms");
    }

    #[tokio::test]
    async fn unknown_key_is_reported() {
        let kms = LocalKms::new(InMemoryKeyProvider::new());
        let err = kms
            .decrypt(&key("never-created"), &[0u8; 40])
            .await
            .expect_err("no such key");
        assert!(matches!(err, KmsError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn ciphertext_is_bound_to_its_key() {
        let kms = LocalKms::new(InMemoryKeyProvider::new());
        let sealed = kms.encrypt(&key("a"), b"payload").await.expect("encrypt");
        kms.encrypt(&key("b"), b"warm up b").await.expect("encrypt");

        let err = kms.decrypt(&key("b"), &sealed).await.expect_err("wrong key");
        assert!(matches!(err, KmsError::InvalidCiphertext { .. }));
    }

    #[tokio::test]
    async fn rejects_truncated_and_tampered_payloads() {
        let kms = LocalKms::new(InMemoryKeyProvider::new());
        let mut sealed = kms.encrypt(&key("a"), b"payload").await.expect("encrypt");

        let err = kms.decrypt(&key("a"), &sealed[..5]).await.expect_err("short");
        assert!(matches!(err, KmsError::InvalidCiphertext { .. }));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let err = kms.decrypt(&key("a"), &sealed).await.expect_err("tampered");
        assert!(matches!(err, KmsError::InvalidCiphertext { .. }));
    }
}
