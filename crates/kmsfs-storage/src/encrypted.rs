//! Transparent decryption of KMS-sealed files.
//!
//! A ciphertext file `name.encrypted` is served only when its directory also
//! holds `name.keyname`, a text file naming the key that decrypts it:
//!
//! ```text
//! # production signing key
//! projects/my-project/locations/global/keyRings/my-ring/cryptoKeys/my-key
//! ```
//!
//! Blank lines and `#` comments are skipped and the first remaining line must be
//! the key reference. [`EncryptedFileStore`] wraps any [`FileStore`] so that
//! callers see decrypted content through the same contract. Direct lookups fail
//! loudly on invalid pairs; listings silently leave them out.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    io::Cursor,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kmsfs_core::{
    files::{FileEntry, FileStore, FileStoreError},
    kms::{KeyDecryptor, KeyReference, KeyReferenceError},
    watch::ChangeToken,
};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

pub const ENCRYPTED_EXTENSION: &str = ".encrypted";
pub const KEYNAME_EXTENSION: &str = ".keyname";

/// Companion key name path for a ciphertext path, `None` if it is not one.
pub fn keyname_for(path: &str) -> Option<String> {
    path.strip_suffix(ENCRYPTED_EXTENSION)
        .map(|stem| format!("{stem}{KEYNAME_EXTENSION}"))
}

/// Parse the contents of a key name file located at `path`.
///
/// Only the first non-blank, non-comment line is considered; anything after it
/// is ignored even when that line is malformed.
pub fn parse_key_name_file(path: &str, contents: &str) -> Result<KeyReference, FileStoreError> {
    let line = contents
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| FileStoreError::MalformedKeyFile {
            path: path.to_string(),
            reason: "no key reference found".to_string(),
        })?;

    line.parse().map_err(|err: KeyReferenceError| FileStoreError::MalformedKeyFile {
        path: path.to_string(),
        reason: err.to_string(),
    })
}

/// Decrypting view over an inner [`FileStore`].
pub struct EncryptedFileStore<S, D: ?Sized> {
    inner: S,
    decryptor: Arc<D>,
}

impl<S, D> EncryptedFileStore<S, D>
where
    S: FileStore,
    D: KeyDecryptor + ?Sized,
{
    pub fn new(inner: S, decryptor: Arc<D>) -> Self {
        Self { inner, decryptor }
    }

    /// The wrapped store, for raw (undecrypted) access.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S, D> FileStore for EncryptedFileStore<S, D>
where
    S: FileStore,
    D: KeyDecryptor + ?Sized + 'static,
{
    type Entry = EncryptedEntry<S::Entry, D>;
    type Listing = EncryptedDirectoryListing<S::Entry, D>;

    #[instrument(skip_all, fields(path = %path))]
    async fn list_directory(&self, path: &str) -> Result<Option<Self::Listing>, FileStoreError> {
        let Some(listing) = self.inner.list_directory(path).await? else {
            return Ok(None);
        };
        Ok(Some(EncryptedDirectoryListing::new(
            listing.into_iter().collect(),
            Arc::clone(&self.decryptor),
        )))
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn get_file(&self, path: &str) -> Result<Self::Entry, FileStoreError> {
        let entry = self.inner.get_file(path).await?;
        if entry.is_directory() {
            return Ok(EncryptedEntry::Directory(entry));
        }

        let Some(keyname_path) = keyname_for(entry.path()) else {
            debug!("not an encrypted file");
            return Err(FileStoreError::not_found(path));
        };

        let keyname = match self.inner.get_file(&keyname_path).await {
            Ok(keyname) if keyname.exists() && !keyname.is_directory() => keyname,
            Ok(_) | Err(FileStoreError::NotFound { .. }) => {
                return Err(FileStoreError::MissingKeyMaterial {
                    keyname: keyname_path,
                })
            }
            Err(err) => return Err(err),
        };

        Ok(EncryptedEntry::File(EncryptedFileEntry::new(
            entry,
            Some(keyname),
            Arc::clone(&self.decryptor),
        )))
    }

    fn watch(&self, filter: &str) -> Box<dyn ChangeToken> {
        self.inner.watch(filter)
    }
}

/// Entry served by [`EncryptedFileStore`]: a pass-through directory or a decrypting file.
pub enum EncryptedEntry<E, D: ?Sized> {
    Directory(E),
    File(EncryptedFileEntry<E, D>),
}

impl<E, D: ?Sized> EncryptedEntry<E, D> {
    pub fn as_file(&self) -> Option<&EncryptedFileEntry<E, D>> {
        match self {
            Self::Directory(_) => None,
            Self::File(file) => Some(file),
        }
    }
}

impl<E: Clone, D: ?Sized> Clone for EncryptedEntry<E, D> {
    fn clone(&self) -> Self {
        match self {
            Self::Directory(entry) => Self::Directory(entry.clone()),
            Self::File(file) => Self::File(file.clone()),
        }
    }
}

impl<E: fmt::Debug, D: ?Sized> fmt::Debug for EncryptedEntry<E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(entry) => f.debug_tuple("Directory").field(entry).finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
        }
    }
}

#[async_trait]
impl<E, D> FileEntry for EncryptedEntry<E, D>
where
    E: FileEntry,
    D: KeyDecryptor + ?Sized + 'static,
{
    fn name(&self) -> &str {
        match self {
            Self::Directory(entry) => entry.name(),
            Self::File(file) => file.name(),
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Directory(entry) => entry.path(),
            Self::File(file) => file.path(),
        }
    }

    fn exists(&self) -> bool {
        match self {
            Self::Directory(entry) => entry.exists(),
            Self::File(file) => file.exists(),
        }
    }

    fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Directory(entry) => entry.last_modified(),
            Self::File(file) => file.last_modified(),
        }
    }

    async fn length(&self) -> Result<u64, FileStoreError> {
        match self {
            Self::Directory(entry) => entry.length().await,
            Self::File(file) => file.length().await,
        }
    }

    async fn read(&self) -> Result<Vec<u8>, FileStoreError> {
        match self {
            Self::Directory(entry) => entry.read().await,
            Self::File(file) => file.read().await,
        }
    }
}

/// A ciphertext file paired with its key name file.
///
/// The key reference is resolved on first use and kept for the life of the
/// entry. Plaintext is never kept: every read decrypts again.
pub struct EncryptedFileEntry<E, D: ?Sized> {
    ciphertext: E,
    keyname: Option<E>,
    decryptor: Arc<D>,
    key: OnceCell<KeyReference>,
}

impl<E, D> EncryptedFileEntry<E, D>
where
    E: FileEntry,
    D: KeyDecryptor + ?Sized + 'static,
{
    pub fn new(ciphertext: E, keyname: Option<E>, decryptor: Arc<D>) -> Self {
        Self {
            ciphertext,
            keyname,
            decryptor,
            key: OnceCell::new(),
        }
    }

    /// Path the key name file is expected at.
    pub fn keyname_path(&self) -> String {
        match &self.keyname {
            Some(keyname) => keyname.path().to_string(),
            None => keyname_for(self.ciphertext.path())
                .unwrap_or_else(|| format!("{}{KEYNAME_EXTENSION}", self.ciphertext.path())),
        }
    }

    /// Key named by the companion file.
    pub async fn key_reference(&self) -> Result<&KeyReference, FileStoreError> {
        self.key
            .get_or_try_init(|| self.resolve_key_reference())
            .await
    }

    /// Decrypted content as a fresh in-memory reader.
    pub async fn open(&self) -> Result<Cursor<Vec<u8>>, FileStoreError> {
        Ok(Cursor::new(FileEntry::read(self).await?))
    }

    async fn resolve_key_reference(&self) -> Result<KeyReference, FileStoreError> {
        let missing = || FileStoreError::MissingKeyMaterial {
            keyname: self.keyname_path(),
        };
        let keyname = match &self.keyname {
            Some(keyname) if keyname.exists() && !keyname.is_directory() => keyname,
            _ => return Err(missing()),
        };

        let bytes = match keyname.read().await {
            Ok(bytes) => bytes,
            Err(FileStoreError::NotFound { .. }) => return Err(missing()),
            Err(err) => return Err(err),
        };
        let contents = String::from_utf8(bytes).map_err(|_| FileStoreError::MalformedKeyFile {
            path: keyname.path().to_string(),
            reason: "key name file is not valid UTF-8".to_string(),
        })?;

        let key = parse_key_name_file(keyname.path(), &contents)?;
        debug!(path = keyname.path(), key = %key, "resolved key reference");
        Ok(key)
    }
}

impl<E: Clone, D: ?Sized> Clone for EncryptedFileEntry<E, D> {
    fn clone(&self) -> Self {
        Self {
            ciphertext: self.ciphertext.clone(),
            keyname: self.keyname.clone(),
            decryptor: Arc::clone(&self.decryptor),
            key: self.key.clone(),
        }
    }
}

impl<E: fmt::Debug, D: ?Sized> fmt::Debug for EncryptedFileEntry<E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedFileEntry")
            .field("ciphertext", &self.ciphertext)
            .field("keyname", &self.keyname)
            .field("key", &self.key.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<E, D> FileEntry for EncryptedFileEntry<E, D>
where
    E: FileEntry,
    D: KeyDecryptor + ?Sized + 'static,
{
    fn name(&self) -> &str {
        self.ciphertext.name()
    }

    fn path(&self) -> &str {
        self.ciphertext.path()
    }

    fn exists(&self) -> bool {
        self.ciphertext.exists() && self.ciphertext.name().ends_with(ENCRYPTED_EXTENSION)
    }

    fn is_directory(&self) -> bool {
        false
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.ciphertext.last_modified()
    }

    /// Plaintext length; decrypts the whole file to find it.
    async fn length(&self) -> Result<u64, FileStoreError> {
        Ok(FileEntry::read(self).await?.len() as u64)
    }

    #[instrument(skip_all, fields(path = %self.ciphertext.path()))]
    async fn read(&self) -> Result<Vec<u8>, FileStoreError> {
        let ciphertext = self.ciphertext.read().await?;
        let key = self.key_reference().await?;
        Ok(self.decryptor.decrypt(key, &ciphertext).await?)
    }
}

/// Directory listing with ciphertext files paired to their key name files.
///
/// Holds the inner listing; each iteration pairs it afresh.
pub struct EncryptedDirectoryListing<E, D: ?Sized> {
    entries: Vec<E>,
    decryptor: Arc<D>,
}

impl<E: Clone, D: ?Sized> EncryptedDirectoryListing<E, D> {
    pub fn new(entries: Vec<E>, decryptor: Arc<D>) -> Self {
        Self { entries, decryptor }
    }

    pub fn iter(&self) -> PairedEntries<E, D> {
        PairedEntries::new(self.entries.clone(), Arc::clone(&self.decryptor))
    }
}

impl<E, D> IntoIterator for EncryptedDirectoryListing<E, D>
where
    E: FileEntry,
    D: KeyDecryptor + ?Sized + 'static,
{
    type Item = EncryptedEntry<E, D>;
    type IntoIter = PairedEntries<E, D>;

    fn into_iter(self) -> Self::IntoIter {
        PairedEntries::new(self.entries, self.decryptor)
    }
}

impl<E, D> IntoIterator for &EncryptedDirectoryListing<E, D>
where
    E: FileEntry,
    D: KeyDecryptor + ?Sized + 'static,
{
    type Item = EncryptedEntry<E, D>;
    type IntoIter = PairedEntries<E, D>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy pairing pass over a listing.
///
/// Directories come out as they are met; ciphertext files are held back until
/// the inner listing is exhausted and then yielded in their original order when
/// a key name file with the matching name was seen.
pub struct PairedEntries<E, D: ?Sized> {
    entries: std::vec::IntoIter<E>,
    ciphertexts: VecDeque<E>,
    keynames: HashMap<String, E>,
    decryptor: Arc<D>,
}

impl<E, D: ?Sized> PairedEntries<E, D> {
    fn new(entries: Vec<E>, decryptor: Arc<D>) -> Self {
        Self {
            entries: entries.into_iter(),
            ciphertexts: VecDeque::new(),
            keynames: HashMap::new(),
            decryptor,
        }
    }
}

impl<E, D> Iterator for PairedEntries<E, D>
where
    E: FileEntry,
    D: KeyDecryptor + ?Sized + 'static,
{
    type Item = EncryptedEntry<E, D>;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            if entry.is_directory() {
                return Some(EncryptedEntry::Directory(entry));
            }
            if entry.name().ends_with(ENCRYPTED_EXTENSION) {
                self.ciphertexts.push_back(entry);
            } else if entry.name().ends_with(KEYNAME_EXTENSION) {
                self.keynames.insert(entry.name().to_string(), entry);
            }
        }

        while let Some(ciphertext) = self.ciphertexts.pop_front() {
            let keyname = keyname_for(ciphertext.name()).and_then(|name| self.keynames.get(&name));
            match keyname {
                Some(keyname) => {
                    return Some(EncryptedEntry::File(EncryptedFileEntry::new(
                        ciphertext,
                        Some(keyname.clone()),
                        Arc::clone(&self.decryptor),
                    )))
                }
                None => debug!(
                    path = ciphertext.path(),
                    "skipping ciphertext without key name file"
                ),
            }
        }
        None
    }
}
