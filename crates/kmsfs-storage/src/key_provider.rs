use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use kmsfs_core::kms::KeyReference;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Symmetric key material for one named key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Identifier for logging/rotation (never log key bytes).
    pub id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Source of key material for locally managed keys (OS keychain in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Existing material for `key`, if any.
    async fn get(&self, key: &KeyReference) -> Result<Option<KeyMaterial>, KeyError>;

    /// Existing material for `key`, generating and persisting it when missing.
    async fn get_or_create(&self, key: &KeyReference) -> Result<KeyMaterial, KeyError>;
}

/// OS keyring-backed provider. One keyring entry per key reference.
pub struct KeyringProvider {
    service: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &KeyReference) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, &key.to_string())
            .map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    async fn get(&self, key: &KeyReference) -> Result<Option<KeyMaterial>, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        match self.entry(key)?.get_password() {
            Ok(secret) => decode_key(key, &secret).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }

    async fn get_or_create(&self, key: &KeyReference) -> Result<KeyMaterial, KeyError> {
        if let Some(existing) = self.get(key).await? {
            return Ok(existing);
        }

        let material = generate_key(key);
        self.entry(key)?
            .set_password(&encode_key(&material))
            .map_err(|e| KeyError::Keyring(e.to_string()))?;
        Ok(material)
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<HashMap<KeyReference, KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get(&self, key: &KeyReference) -> Result<Option<KeyMaterial>, KeyError> {
        let guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        Ok(guard.get(key).cloned())
    }

    async fn get_or_create(&self, key: &KeyReference) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        let material = guard
            .entry(key.clone())
            .or_insert_with(|| generate_key(key))
            .clone();
        Ok(material)
    }
}

fn generate_key(key: &KeyReference) -> KeyMaterial {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial {
        id: key.key_id().to_string(),
        bytes,
    }
}

fn encode_key(material: &KeyMaterial) -> String {
    general_purpose::STANDARD.encode(material.bytes)
}

fn decode_key(key: &KeyReference, secret: &str) -> Result<KeyMaterial, KeyError> {
    let bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        KeyError::Decode(format!("expected 32 bytes, got {}", bytes.len()))
    })?;

    Ok(KeyMaterial {
        id: key.key_id().to_string(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> KeyReference {
        KeyReference::new("p", "global", "ring", name)
    }

    #[tokio::test]
    async fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::new();
        let first = provider.get_or_create(&key("a")).await.unwrap();
        let second = provider.get_or_create(&key("a")).await.unwrap();

        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.id, "a");
    }

    #[tokio::test]
    async fn memory_provider_keeps_keys_apart() {
        let provider = InMemoryKeyProvider::new();
        assert!(provider.get(&key("a")).await.unwrap().is_none());

        let a = provider.get_or_create(&key("a")).await.unwrap();
        let b = provider.get_or_create(&key("b")).await.unwrap();
        assert_ne!(a.bytes, b.bytes);
        assert_eq!(provider.get(&key("a")).await.unwrap(), Some(a));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key(&key("a"), "abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn encoded_keys_decode_back() {
        let material = generate_key(&key("a"));
        let decoded = decode_key(&key("a"), &encode_key(&material)).expect("decode");
        assert_eq!(decoded, material);
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let material = KeyMaterial {
            id: "k".into(),
            bytes: [7u8; 32],
        };
        let rendered = format!("{material:?}");
        assert!(rendered.contains("\"k\""));
        assert!(!rendered.contains('7'));
    }
}
