use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    files::{file_name, normalize_path, FileEntry, FileStore, FileStoreError},
    watch::{filter_matches, ChangeSignal, ChangeToken},
};

#[derive(Debug, Clone)]
enum Node {
    Directory { modified: DateTime<Utc> },
    File { bytes: Vec<u8>, modified: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    reads: HashMap<String, usize>,
    watchers: Vec<(String, ChangeSignal)>,
}

impl State {
    fn notify(&mut self, path: &str) {
        for (filter, signal) in &self.watchers {
            if filter_matches(filter, path) {
                signal.fire();
            }
        }
        self.prune_watchers();
    }

    /// Fired signals never reset and unobserved ones can never be read.
    fn prune_watchers(&mut self) {
        self.watchers
            .retain(|(_, signal)| signal.is_observed() && !signal.has_changed());
    }
}

/// In-memory file tree for tests and smoke runs.
///
/// Parent directories are created implicitly when a file is inserted. Every
/// `read` is counted per path so callers can assert how often content was
/// fetched.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFileStore {
    inner: Arc<Mutex<State>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file, creating missing parent directories.
    pub fn insert_file(&self, path: &str, bytes: impl Into<Vec<u8>>) -> Result<(), FileStoreError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(FileStoreError::Storage {
                reason: "cannot write to the root".to_string(),
            });
        }
        let mut state = lock(&self.inner)?;
        ensure_parents(&mut state, &path)?;
        if let Some(Node::Directory { .. }) = state.nodes.get(&path) {
            return Err(FileStoreError::Storage {
                reason: format!("{path} is a directory"),
            });
        }
        state.nodes.insert(
            path.clone(),
            Node::File {
                bytes: bytes.into(),
                modified: Utc::now(),
            },
        );
        debug!(path, "inserted file");
        state.notify(&path);
        Ok(())
    }

    /// Create a directory (and its parents). Existing directories are left as is.
    pub fn create_dir(&self, path: &str) -> Result<(), FileStoreError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Ok(());
        }
        let mut state = lock(&self.inner)?;
        ensure_parents(&mut state, &path)?;
        match state.nodes.get(&path) {
            Some(Node::Directory { .. }) => return Ok(()),
            Some(Node::File { .. }) => {
                return Err(FileStoreError::Storage {
                    reason: format!("{path} is a file"),
                })
            }
            None => {}
        }
        state.nodes.insert(
            path.clone(),
            Node::Directory {
                modified: Utc::now(),
            },
        );
        state.notify(&path);
        Ok(())
    }

    /// Remove an entry and everything below it (idempotent).
    pub fn remove(&self, path: &str) -> Result<(), FileStoreError> {
        let path = normalize_path(path);
        let prefix = format!("{path}/");
        let mut state = lock(&self.inner)?;
        let doomed: Vec<String> = state
            .nodes
            .keys()
            .filter(|key| **key == path || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &doomed {
            state.nodes.remove(key);
            state.notify(key);
        }
        Ok(())
    }

    /// Number of times the content at `path` has been read.
    pub fn read_count(&self, path: &str) -> usize {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.reads.get(&normalize_path(path)).copied().unwrap_or(0)
    }

    fn entry_for(&self, path: String, node: Option<&Node>) -> MemoryEntry {
        let name = file_name(&path).to_string();
        let (exists, is_directory, last_modified, length) = match node {
            Some(Node::Directory { modified }) => (true, true, Some(*modified), 0),
            Some(Node::File { bytes, modified }) => {
                (true, false, Some(*modified), bytes.len() as u64)
            }
            None if path.is_empty() => (true, true, None, 0),
            None => (false, false, None, 0),
        };
        MemoryEntry {
            path,
            name,
            exists,
            is_directory,
            last_modified,
            length,
            state: Arc::clone(&self.inner),
        }
    }
}

fn lock(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, FileStoreError> {
    state.lock().map_err(|err| FileStoreError::Storage {
        reason: format!("lock poisoned: {err}"),
    })
}

fn ensure_parents(state: &mut State, path: &str) -> Result<(), FileStoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    for depth in 1..segments.len() {
        let parent = segments[..depth].join("/");
        match state.nodes.get(&parent) {
            Some(Node::Directory { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(FileStoreError::Storage {
                    reason: format!("{parent} is a file"),
                })
            }
            None => {
                state.nodes.insert(
                    parent,
                    Node::Directory {
                        modified: Utc::now(),
                    },
                );
            }
        }
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Entry handed out by [`InMemoryFileStore`].
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    path: String,
    name: String,
    exists: bool,
    is_directory: bool,
    last_modified: Option<DateTime<Utc>>,
    length: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl FileEntry for MemoryEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn exists(&self) -> bool {
        self.exists
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
        let mut state = lock(&self.state)?;
        *state.reads.entry(self.path.clone()).or_insert(0) += 1;
        match state.nodes.get(&self.path) {
            Some(Node::File { bytes, .. }) => Ok(bytes.clone()),
            Some(Node::Directory { .. }) => Err(FileStoreError::Storage {
                reason: format!("{} is a directory", self.path),
            }),
            None => Err(FileStoreError::not_found(&self.path)),
        }
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    type Entry = MemoryEntry;
    type Listing = Vec<MemoryEntry>;

    async fn list_directory(&self, path: &str) -> Result<Option<Vec<MemoryEntry>>, FileStoreError> {
        let path = normalize_path(path);
        let state = lock(&self.inner)?;
        if !path.is_empty() && !matches!(state.nodes.get(&path), Some(Node::Directory { .. })) {
            return Ok(None);
        }
        let children = state
            .nodes
            .iter()
            .filter(|(key, _)| !key.is_empty() && parent_of(key) == path)
            .map(|(key, node)| self.entry_for(key.clone(), Some(node)))
            .collect();
        Ok(Some(children))
    }

    async fn get_file(&self, path: &str) -> Result<MemoryEntry, FileStoreError> {
        let path = normalize_path(path);
        let state = lock(&self.inner)?;
        let node = state.nodes.get(&path);
        if node.is_none() && !path.is_empty() {
            return Err(FileStoreError::not_found(path));
        }
        Ok(self.entry_for(path, node))
    }

    fn watch(&self, filter: &str) -> Box<dyn ChangeToken> {
        let signal = ChangeSignal::new();
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.prune_watchers();
        state.watchers.push((filter.to_string(), signal.clone()));
        Box::new(signal)
    }
}
