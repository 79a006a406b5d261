use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grammar accepted by [`KeyReference::from_str`], used in diagnostics.
pub const KEY_REFERENCE_GRAMMAR: &str =
    "projects/<project>/locations/<location>/keyRings/<key-ring>/cryptoKeys/<key>";

/// Fully qualified name of a key held by a key management service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyReference {
    project_id: String,
    location_id: String,
    key_ring_id: String,
    key_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid key reference `{input}`: expected `{KEY_REFERENCE_GRAMMAR}`")]
pub struct KeyReferenceError {
    pub input: String,
}

impl KeyReference {
    pub fn new(
        project_id: impl Into<String>,
        location_id: impl Into<String>,
        key_ring_id: impl Into<String>,
        key_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location_id: location_id.into(),
            key_ring_id: key_ring_id.into(),
            key_id: key_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    pub fn key_ring_id(&self) -> &str {
        &self.key_ring_id
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl FromStr for KeyReference {
    type Err = KeyReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeyReferenceError {
            input: s.to_string(),
        };
        let segments: Vec<&str> = s.split('/').collect();
        match segments.as_slice() {
            ["projects", project, "locations", location, "keyRings", ring, "cryptoKeys", key]
                if [project, location, ring, key].iter().all(|id| !id.is_empty()) =>
            {
                Ok(Self::new(*project, *location, *ring, *key))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            self.project_id, self.location_id, self.key_ring_id, self.key_id
        )
    }
}

impl TryFrom<String> for KeyReference {
    type Error = KeyReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyReference> for String {
    fn from(key: KeyReference) -> Self {
        key.to_string()
    }
}

/// Failures reported by a key management service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KmsError {
    #[error("key not found: {key}")]
    KeyNotFound { key: String },
    #[error("permission denied for key: {key}")]
    PermissionDenied { key: String },
    #[error("invalid ciphertext: {reason}")]
    InvalidCiphertext { reason: String },
    #[error("key service failure: {reason}")]
    Backend { reason: String },
}

/// Decrypts ciphertext with a named key (remote KMS in production).
#[async_trait]
pub trait KeyDecryptor: Send + Sync {
    async fn decrypt(&self, key: &KeyReference, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

/// Encrypts plaintext with a named key; the inverse of [`KeyDecryptor`].
#[async_trait]
pub trait KeyEncryptor: Send + Sync {
    async fn encrypt(&self, key: &KeyReference, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

#[async_trait]
impl<T> KeyDecryptor for Arc<T>
where
    T: KeyDecryptor + ?Sized,
{
    async fn decrypt(&self, key: &KeyReference, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        (**self).decrypt(key, ciphertext).await
    }
}

#[async_trait]
impl<T> KeyDecryptor for Box<T>
where
    T: KeyDecryptor + ?Sized,
{
    async fn decrypt(&self, key: &KeyReference, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        (**self).decrypt(key, ciphertext).await
    }
}

#[async_trait]
impl<T> KeyEncryptor for Arc<T>
where
    T: KeyEncryptor + ?Sized,
{
    async fn encrypt(&self, key: &KeyReference, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        (**self).encrypt(key, plaintext).await
    }
}

#[async_trait]
impl<T> KeyEncryptor for Box<T>
where
    T: KeyEncryptor + ?Sized,
{
    async fn encrypt(&self, key: &KeyReference, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        (**self).encrypt(key, plaintext).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "projects/my-project/locations/global/keyRings/my-ring/cryptoKeys/my-key";

    #[test]
    fn parses_and_displays_full_name() {
        let key: KeyReference = KEY.parse().expect("parse");
        assert_eq!(key.project_id(), "my-project");
        assert_eq!(key.location_id(), "global");
        assert_eq!(key.key_ring_id(), "my-ring");
        assert_eq!(key.key_id(), "my-key");
        assert_eq!(key.to_string(), KEY);
    }

    #[test]
    fn rejects_wrong_shapes() {
        for input in [
            "not-a-key",
            "projects/p/locations/l/keyRings/r",
            "projects/p/locations/l/keyRings/r/cryptoKeys/k/cryptoKeyVersions/1",
            "projects//locations/l/keyRings/r/cryptoKeys/k",
            "project/p/locations/l/keyRings/r/cryptoKeys/k",
            "projects/p/locations/l/keyrings/r/cryptoKeys/k",
            "",
        ] {
            let err = input.parse::<KeyReference>().expect_err(input);
            assert_eq!(err.input, input);
        }
    }

    #[test]
    fn error_names_the_grammar() {
        let err = "nope".parse::<KeyReference>().expect_err("should fail");
        assert!(err.to_string().contains(KEY_REFERENCE_GRAMMAR));
        assert!(err.to_string().contains("`nope`"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let key: KeyReference = KEY.parse().expect("parse");
        let json = serde_json::to_string(&key).expect("serialize");
        assert_eq!(json, format!("\"{KEY}\""));
        let back: KeyReference = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, key);
        assert!(serde_json::from_str::<KeyReference>("\"bad\"").is_err());
    }

    struct Reverse;

    #[async_trait]
    impl KeyDecryptor for Reverse {
        async fn decrypt(&self, _key: &KeyReference, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
            Ok(ciphertext.iter().rev().copied().collect())
        }
    }

    #[tokio::test]
    async fn shared_decryptors_delegate() {
        let key: KeyReference = KEY.parse().expect("parse");
        let shared: Arc<dyn KeyDecryptor> = Arc::new(Reverse);
        assert_eq!(shared.decrypt(&key, b"abc").await.expect("decrypt"), b"cba");
        let boxed: Box<dyn KeyDecryptor> = Box::new(Reverse);
        assert_eq!(boxed.decrypt(&key, b"xy").await.expect("decrypt"), b"yx");
    }
}
