use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use kmsfs_core::kms::{KeyDecryptor, KeyEncryptor, KeyReference, KmsError};
use reqwest::{header::USER_AGENT, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument};

pub const DEFAULT_ENDPOINT: &str = "https://cloudkms.googleapis.com";

/// Connection settings for the Cloud KMS REST API.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CloudKmsSettings {
    /// OAuth2 bearer token with `cloudkms.cryptoKeyVersions.useToDecrypt` (and encrypt) rights.
    pub access_token: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Symmetric encrypt/decrypt against Cloud KMS over REST.
pub struct CloudKmsClient {
    settings: CloudKmsSettings,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct DecryptRequest {
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    // Omitted by the service when the plaintext is empty.
    #[serde(default)]
    plaintext: String,
}

#[derive(Debug, Serialize)]
struct EncryptRequest {
    plaintext: String,
}

#[derive(Debug, Deserialize)]
struct EncryptResponse {
    #[serde(default)]
    name: Option<String>,
    ciphertext: String,
}

impl CloudKmsClient {
    pub fn new(settings: CloudKmsSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    /// `{endpoint}/v1/{key}:{verb}`, with every id percent-encoded as its own segment.
    fn url(&self, key: &KeyReference, verb: &str) -> Result<Url, KmsError> {
        let base = self.settings.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let invalid = || KmsError::Backend {
            reason: format!("invalid endpoint `{base}`"),
        };
        let mut url = Url::parse(base).map_err(|_| invalid())?;
        let method = format!("{}:{verb}", key.key_id());
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend([
                "v1",
                "projects",
                key.project_id(),
                "locations",
                key.location_id(),
                "keyRings",
                key.key_ring_id(),
                "cryptoKeys",
                method.as_str(),
            ]);
        Ok(url)
    }

    async fn call<Req, Resp>(&self, key: &KeyReference, verb: &str, body: &Req) -> Result<Resp, KmsError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(key, verb)?;
        let resp = self
            .client
            .post(url.clone())
            .bearer_auth(&self.settings.access_token)
            .header(USER_AGENT, "kmsfs")
            .json(body)
            .send()
            .await
            .map_err(|e| KmsError::Backend {
                reason: format!("request to {url} failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), key, &detail));
        }

        resp.json().await.map_err(|e| KmsError::Backend {
            reason: format!("invalid {verb} response: {e}"),
        })
    }
}

#[async_trait]
impl KeyDecryptor for CloudKmsClient {
    #[instrument(skip_all, fields(key = %key))]
    async fn decrypt(&self, key: &KeyReference, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let request = DecryptRequest {
            ciphertext: BASE64.encode(ciphertext),
        };
        let response: DecryptResponse = self.call(key, "decrypt", &request).await?;
        BASE64
            .decode(response.plaintext)
            .map_err(|e| KmsError::Backend {
                reason: format!("plaintext decode failed: {e}"),
            })
    }
}

#[async_trait]
impl KeyEncryptor for CloudKmsClient {
    #[instrument(skip_all, fields(key = %key))]
    async fn encrypt(&self, key: &KeyReference, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let request = EncryptRequest {
            plaintext: BASE64.encode(plaintext),
        };
        let response: EncryptResponse = self.call(key, "encrypt", &request).await?;
        if let Some(version) = &response.name {
            debug!(version = %version, "encrypted with key version");
        }
        BASE64
            .decode(response.ciphertext)
            .map_err(|e| KmsError::Backend {
                reason: format!("ciphertext decode failed: {e}"),
            })
    }
}

/// Map a non-success HTTP status onto the key service error taxonomy.
fn status_error(status: u16, key: &KeyReference, detail: &str) -> KmsError {
    match status {
        404 => KmsError::KeyNotFound {
            key: key.to_string(),
        },
        401 | 403 => KmsError::PermissionDenied {
            key: key.to_string(),
        },
        400 => KmsError::InvalidCiphertext {
            reason: if detail.is_empty() {
                "rejected by key service".to_string()
            } else {
                detail.to_string()
            },
        },
        _ => KmsError::Backend {
            reason: format!("HTTP {status}: {detail}"),
        },
    }
}
