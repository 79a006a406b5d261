use std::{
    collections::BTreeMap,
    fs::{self, Metadata},
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::SystemTime,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kmsfs_core::{
    files::{file_name, join_path, normalize_path, FileEntry, FileStore, FileStoreError},
    watch::{filter_matches, ChangeToken},
};
use tracing::{debug, instrument};
use walkdir::WalkDir;

/// [`FileStore`] over a directory on the local filesystem.
///
/// Store paths are resolved below `root`; paths that would escape it are
/// reported as not found.
#[derive(Debug, Clone)]
pub struct PhysicalFileStore {
    root: PathBuf,
}

impl PhysicalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), FileStoreError> {
        let normalized = normalize_path(path);
        let mut full = self.root.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => full.push(segment),
                _ => return Err(FileStoreError::not_found(path)),
            }
        }
        Ok((normalized, full))
    }
}

/// Entry handed out by [`PhysicalFileStore`].
#[derive(Debug, Clone)]
pub struct PhysicalEntry {
    path: String,
    name: String,
    full_path: PathBuf,
    is_directory: bool,
    last_modified: Option<DateTime<Utc>>,
    length: u64,
}

impl PhysicalEntry {
    fn from_metadata(path: String, full_path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            name: file_name(&path).to_string(),
            path,
            full_path,
            is_directory: metadata.is_dir(),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            length: if metadata.is_dir() { 0 } else { metadata.len() },
        }
    }
}

#[async_trait]
impl FileEntry for PhysicalEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn exists(&self) -> bool {
        self.full_path.exists()
    }

    fn is_directory(&self) -> bool {
        self.is_directory
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    async fn length(&self) -> Result<u64, FileStoreError> {
        Ok(self.length)
    }

    async fn read(&self) -> Result<Vec<u8>, FileStoreError> {
        fs::read(&self.full_path).map_err(|err| io_err(&self.path, err))
    }
}

#[async_trait]
impl FileStore for PhysicalFileStore {
    type Entry = PhysicalEntry;
    type Listing = Vec<PhysicalEntry>;

    #[instrument(skip_all, fields(path = %path))]
    async fn list_directory(&self, path: &str) -> Result<Option<Vec<PhysicalEntry>>, FileStoreError> {
        let (dir, full) = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(FileStoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let read_dir = match fs::read_dir(&full) {
            Ok(read_dir) => read_dir,
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(None)
            }
            Err(err) => return Err(FileStoreError::storage(err)),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(FileStoreError::storage)?;
            let Some(name) = dir_entry.file_name().to_str().map(str::to_string) else {
                debug!(name = ?dir_entry.file_name(), "skipping non UTF-8 name");
                continue;
            };
            // Follows symlinks; dangling links are left out.
            let metadata = match fs::metadata(dir_entry.path()) {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(%name, %err, "skipping unreadable entry");
                    continue;
                }
            };
            entries.push(PhysicalEntry::from_metadata(
                join_path(&dir, &name),
                dir_entry.path(),
                &metadata,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(entries))
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn get_file(&self, path: &str) -> Result<PhysicalEntry, FileStoreError> {
        let (normalized, full) = self.resolve(path)?;
        let metadata = fs::metadata(&full).map_err(|err| io_err(&normalized, err))?;
        Ok(PhysicalEntry::from_metadata(normalized, full, &metadata))
    }

    fn watch(&self, filter: &str) -> Box<dyn ChangeToken> {
        Box::new(PollingChangeToken::new(self.root.clone(), filter))
    }
}

fn io_err(path: &str, err: std::io::Error) -> FileStoreError {
    if err.kind() == ErrorKind::NotFound {
        FileStoreError::not_found(path)
    } else {
        FileStoreError::storage(err)
    }
}

type Fingerprint = BTreeMap<String, (Option<SystemTime>, u64)>;

/// Change token that compares a snapshot of matching files against the disk.
///
/// Each `has_changed` call rescans the tree; once a change is seen the token stays fired.
pub struct PollingChangeToken {
    root: PathBuf,
    filter: String,
    baseline: Fingerprint,
    fired: AtomicBool,
}

impl PollingChangeToken {
    pub fn new(root: PathBuf, filter: &str) -> Self {
        let baseline = fingerprint(&root, filter);
        Self {
            root,
            filter: filter.to_string(),
            baseline,
            fired: AtomicBool::new(false),
        }
    }
}

impl ChangeToken for PollingChangeToken {
    fn has_changed(&self) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return true;
        }
        let changed = fingerprint(&self.root, &self.filter) != self.baseline;
        if changed {
            self.fired.store(true, Ordering::Release);
        }
        changed
    }
}

fn fingerprint(root: &Path, filter: &str) -> Fingerprint {
    let mut out = Fingerprint::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(Result::ok) {
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(path) = store_path(relative) else {
            continue;
        };
        if !filter_matches(filter, &path) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        out.insert(path, (metadata.modified().ok(), metadata.len()));
    }
    out
}

/// `/`-joined store path for a path relative to the root, `None` if not UTF-8.
fn store_path(relative: &Path) -> Option<String> {
    let segments = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}
