use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{kms::KmsError, watch::ChangeToken};

/// Errors produced by file stores and the decrypting layer above them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileStoreError {
    /// The path does not name an entry this store exposes.
    #[error("file not found: {path}")]
    NotFound { path: String },
    /// A ciphertext file has no usable companion key name file.
    #[error("missing key material: expected key name file `{keyname}`")]
    MissingKeyMaterial { keyname: String },
    /// The key name file exists but does not name a key.
    #[error("malformed key name file `{path}`: {reason}")]
    MalformedKeyFile { path: String, reason: String },
    /// Failure reported by the key service, passed through untouched.
    #[error(transparent)]
    Kms(#[from] KmsError),
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

impl FileStoreError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn storage<E: ToString>(err: E) -> Self {
        Self::Storage {
            reason: err.to_string(),
        }
    }
}

/// A file or directory as seen through a [`FileStore`].
///
/// Entries are snapshots: attributes are captured at lookup time, content is
/// fetched on `read`.
#[async_trait]
pub trait FileEntry: Clone + Send + Sync + 'static {
    /// Final path segment.
    fn name(&self) -> &str;

    /// Store-relative path, `/`-separated.
    fn path(&self) -> &str;

    fn exists(&self) -> bool;

    fn is_directory(&self) -> bool;

    fn last_modified(&self) -> Option<DateTime<Utc>>;

    /// Content length in bytes. May require reading the content.
    async fn length(&self) -> Result<u64, FileStoreError>;

    /// Full content of the entry.
    async fn read(&self) -> Result<Vec<u8>, FileStoreError>;
}

/// Hierarchical read-only store of files.
#[async_trait]
pub trait FileStore: Send + Sync {
    type Entry: FileEntry;
    type Listing: IntoIterator<Item = Self::Entry> + Send;

    /// Entries directly under `path`, or `None` when `path` is not a directory.
    async fn list_directory(&self, path: &str) -> Result<Option<Self::Listing>, FileStoreError>;

    /// Look up a single entry. Absence is reported as [`FileStoreError::NotFound`].
    async fn get_file(&self, path: &str) -> Result<Self::Entry, FileStoreError>;

    async fn read_all(&self, entry: &Self::Entry) -> Result<Vec<u8>, FileStoreError> {
        entry.read().await
    }

    /// Token that fires when an entry matching `filter` changes.
    fn watch(&self, filter: &str) -> Box<dyn ChangeToken>;
}

/// Canonical form of a store path: no leading, trailing or doubled slashes.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    if dir.is_empty() {
        normalize_path(name)
    } else {
        format!("{dir}/{}", normalize_path(name))
    }
}

/// Final segment of a normalized path; the root has an empty name.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("/a//b/./c/"), "a/b/c");
        assert_eq!(normalize_path("/"), "");
        assert_eq!(join_path("", "x.encrypted"), "x.encrypted");
        assert_eq!(join_path("/dir/", "x.keyname"), "dir/x.keyname");
    }

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!(file_name("a/b/secrets.json.encrypted"), "secrets.json.encrypted");
        assert_eq!(file_name("top"), "top");
        assert_eq!(file_name(""), "");
    }

    #[test]
    fn kms_errors_pass_through_verbatim() {
        let inner = KmsError::PermissionDenied {
            key: "projects/p/locations/l/keyRings/r/cryptoKeys/k".into(),
        };
        let wrapped: FileStoreError = inner.clone().into();
        assert_eq!(wrapped.to_string(), inner.to_string());
        assert_eq!(wrapped, FileStoreError::Kms(inner));
    }
}
