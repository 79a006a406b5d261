use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::config::{Backend, Config};
use color_eyre::Result;
use kmsfs_core::kms::{KeyDecryptor, KeyEncryptor};
use kmsfs_storage::{
    cloud_kms::{CloudKmsClient, CloudKmsSettings},
    encrypted::EncryptedFileStore,
    key_provider::KeyringProvider,
    local_kms::LocalKms,
    physical::PhysicalFileStore,
};
use tracing::debug;

pub const DEFAULT_KEYRING_SERVICE: &str = "kmsfs";

/// A key service able to both seal and open files.
pub trait KeyService: KeyDecryptor + KeyEncryptor {}

impl<T: KeyDecryptor + KeyEncryptor + ?Sized> KeyService for T {}

pub type Store = EncryptedFileStore<PhysicalFileStore, dyn KeyService>;

/// Directory to serve: `--root`, then the config file, then the working directory.
pub fn resolve_root(cli_root: Option<&Path>, config: &Config) -> Result<PathBuf> {
    if let Some(root) = cli_root.or(config.root.as_deref()) {
        return Ok(root.to_path_buf());
    }
    Ok(std::env::current_dir()?)
}

/// Build the key service selected by the config.
pub fn key_service(config: &Config) -> Result<Arc<dyn KeyService>> {
    match config.backend {
        Backend::Local => {
            let service = config
                .keyring_service
                .clone()
                .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_string());
            debug!(%service, "using keyring-backed keys");
            Ok(Arc::new(LocalKms::new(KeyringProvider::new(service))))
        }
        Backend::CloudKms => {
            let settings = resolve_cloud_kms_settings(config).ok_or_else(|| {
                color_eyre::eyre::eyre!(
                    "cloud-kms backend needs an access token (cloud_kms.access_token or KMSFS_ACCESS_TOKEN)"
                )
            })?;
            debug!(endpoint = ?settings.endpoint, "using Cloud KMS");
            Ok(Arc::new(CloudKmsClient::new(settings)))
        }
    }
}

fn resolve_cloud_kms_settings(config: &Config) -> Option<CloudKmsSettings> {
    let token = config
        .cloud_kms
        .as_ref()
        .and_then(|c| c.access_token.clone())
        .or_else(|| std::env::var("KMSFS_ACCESS_TOKEN").ok())
        .or_else(|| std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok());

    let endpoint = config.cloud_kms.as_ref().and_then(|c| c.endpoint.clone());

    token.map(|access_token| CloudKmsSettings {
        access_token,
        endpoint,
    })
}

/// Decrypting store rooted at `root`.
pub fn encrypted_store(root: PathBuf, service: Arc<dyn KeyService>) -> Store {
    debug!(?root, "serving encrypted files");
    EncryptedFileStore::new(PhysicalFileStore::new(root), service)
}

/// Key service with throwaway in-memory keys, for tests.
#[cfg(test)]
pub fn test_service() -> Arc<dyn KeyService> {
    use kmsfs_storage::key_provider::InMemoryKeyProvider;

    Arc::new(LocalKms::new(InMemoryKeyProvider::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudKmsConfig;

    #[test]
    fn cli_root_wins_over_config() {
        let config = Config {
            root: Some(PathBuf::from("/from/config")),
            ..Config::default()
        };
        let root = resolve_root(Some(Path::new("/from/cli")), &config).expect("root");
        assert_eq!(root, PathBuf::from("/from/cli"));

        let root = resolve_root(None, &config).expect("root");
        assert_eq!(root, PathBuf::from("/from/config"));
    }

    #[test]
    fn configured_token_is_used_for_cloud_kms() {
        let config = Config {
            backend: Backend::CloudKms,
            cloud_kms: Some(CloudKmsConfig {
                access_token: Some("ya29.token".into()),
                endpoint: Some("http://localhost:9090".into()),
            }),
            ..Config::default()
        };
        let settings = resolve_cloud_kms_settings(&config).expect("settings");
        assert_eq!(settings.access_token, "ya29.token");
        assert_eq!(settings.endpoint.as_deref(), Some("http://localhost:9090"));
        assert!(key_service(&config).is_ok());
    }
}
