use std::{
    collections::HashSet,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
};

use color_eyre::{eyre::eyre, Result};
use kmsfs_core::{
    files::{FileEntry, FileStore},
    kms::{KeyDecryptor, KeyEncryptor, KeyReference},
};
use kmsfs_storage::{
    encrypted::{keyname_for, parse_key_name_file, EncryptedFileStore, ENCRYPTED_EXTENSION, KEYNAME_EXTENSION},
    seal::{seal_file, SealedPair},
};
use tracing::{debug, info};

/// Print the entries of a directory; subdirectories get a trailing `/`.
pub async fn list<S: FileStore>(store: &S, path: &str, out: &mut impl Write) -> Result<()> {
    let listing = store
        .list_directory(path)
        .await?
        .ok_or_else(|| eyre!("not a directory: {path:?}"))?;
    for entry in listing {
        if entry.is_directory() {
            writeln!(out, "{}/", entry.name())?;
        } else {
            writeln!(out, "{}", entry.name())?;
        }
    }
    Ok(())
}

/// Write the content of a file as the store serves it.
pub async fn cat<S: FileStore>(store: &S, path: &str, out: &mut impl Write) -> Result<()> {
    let entry = store.get_file(path).await?;
    if entry.is_directory() {
        return Err(eyre!("{path:?} is a directory"));
    }
    let bytes = store.read_all(&entry).await?;
    out.write_all(&bytes)?;
    out.flush()?;
    Ok(())
}

/// Print the key reference an encrypted file is sealed with.
pub async fn key<S, D>(
    store: &EncryptedFileStore<S, D>,
    path: &str,
    out: &mut impl Write,
) -> Result<()>
where
    S: FileStore,
    D: KeyDecryptor + ?Sized + 'static,
{
    let entry = store.get_file(path).await?;
    let file = entry
        .as_file()
        .ok_or_else(|| eyre!("{path:?} is a directory"))?;
    writeln!(out, "{}", file.key_reference().await?)?;
    Ok(())
}

/// Something `check` found wrong with a pair of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    MissingKeyName { ciphertext: String, keyname: String },
    MalformedKeyName { path: String, reason: String },
    OrphanKeyName { path: String },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::MissingKeyName { ciphertext, keyname } => {
                write!(f, "{ciphertext}: no key name file ({keyname})")
            }
            Problem::MalformedKeyName { path, reason } => write!(f, "{path}: {reason}"),
            Problem::OrphanKeyName { path } => write!(f, "{path}: no matching ciphertext"),
        }
    }
}

/// Audit raw (undecrypted) storage for ciphertexts that the decrypting view would hide.
pub async fn check<S: FileStore>(store: &S, path: &str, recursive: bool) -> Result<Vec<Problem>> {
    let mut problems = Vec::new();
    let mut pending = vec![path.to_string()];
    let mut first = true;

    while let Some(dir) = pending.pop() {
        let Some(listing) = store.list_directory(&dir).await? else {
            if first {
                return Err(eyre!("not a directory: {dir:?}"));
            }
            continue;
        };
        first = false;
        debug!(%dir, "checking directory");

        let entries: Vec<S::Entry> = listing.into_iter().collect();
        let files: HashSet<&str> = entries
            .iter()
            .filter(|e| !e.is_directory())
            .map(|e| e.path())
            .collect();

        for entry in &entries {
            if entry.is_directory() {
                if recursive {
                    pending.push(entry.path().to_string());
                }
                continue;
            }
            if let Some(keyname) = keyname_for(entry.path()) {
                if !files.contains(keyname.as_str()) {
                    problems.push(Problem::MissingKeyName {
                        ciphertext: entry.path().to_string(),
                        keyname,
                    });
                }
            } else if let Some(stem) = entry.path().strip_suffix(KEYNAME_EXTENSION) {
                if !files.contains(format!("{stem}{ENCRYPTED_EXTENSION}").as_str()) {
                    problems.push(Problem::OrphanKeyName {
                        path: entry.path().to_string(),
                    });
                }
                if let Err(reason) = validate_keyname(entry).await {
                    problems.push(Problem::MalformedKeyName {
                        path: entry.path().to_string(),
                        reason,
                    });
                }
            }
        }
    }
    Ok(problems)
}

async fn validate_keyname<E: FileEntry>(entry: &E) -> Result<(), String> {
    let bytes = entry.read().await.map_err(|err| err.to_string())?;
    let contents = String::from_utf8(bytes).map_err(|_| "not valid UTF-8".to_string())?;
    parse_key_name_file(entry.path(), &contents)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

/// Encrypt `source` into `<name>.encrypted` plus `<name>.keyname` under `out`.
pub async fn seal<K: KeyEncryptor + ?Sized>(
    encryptor: &K,
    source: &Path,
    key: &KeyReference,
    out: &Path,
    name: Option<&str>,
) -> Result<SealedPair> {
    let name = match name {
        Some(name) => name.to_string(),
        None => source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| eyre!("cannot derive a name from {}", source.display()))?,
    };
    let plaintext = fs::read(source)?;
    let pair = seal_file(out, &name, key, &plaintext, encryptor).await?;
    info!(ciphertext = %pair.ciphertext.display(), "wrote encrypted pair");
    Ok(pair)
}

/// Default output directory for `seal`: the served root.
pub fn seal_dir(out: Option<PathBuf>, root: &Path) -> PathBuf {
    out.unwrap_or_else(|| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kmsfs_core::{files::FileStoreError, memory::InMemoryFileStore};
    use kmsfs_storage::physical::PhysicalFileStore;

    use super::*;
    use crate::storage::{test_service, KeyService};

    fn key_ref() -> KeyReference {
        KeyReference::new("p", "global", "ring", "k")
    }

    async fn fixture() -> (InMemoryFileStore, Arc<dyn KeyService>) {
        let raw = InMemoryFileStore::new();
        let service = test_service();
        let ciphertext = service.encrypt(&key_ref(), b"s3cret").await.expect("encrypt");
        raw.insert_file("conf/app.json.encrypted", ciphertext).expect("insert");
        raw.insert_file("conf/app.json.keyname", key_ref().to_string()).expect("insert");
        raw.insert_file("conf/lonely.encrypted", b"x".to_vec()).expect("insert");
        raw.insert_file("conf/readme.txt", b"hi".to_vec()).expect("insert");
        raw.create_dir("conf/sub").expect("mkdir");
        (raw, service)
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).expect("utf8")
    }

    #[tokio::test]
    async fn list_shows_directories_and_decryptable_files() {
        let (raw, service) = fixture().await;
        let store = EncryptedFileStore::new(raw, service);
        let mut buf = Vec::new();
        list(&store, "conf", &mut buf).await.expect("list");
        assert_eq!(output(buf), "sub/\napp.json.encrypted\n");
    }

    #[tokio::test]
    async fn list_rejects_files() {
        let (raw, service) = fixture().await;
        let store = EncryptedFileStore::new(raw, service);
        let err = list(&store, "conf/readme.txt", &mut Vec::new())
            .await
            .expect_err("not a dir");
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn cat_and_key_decrypt_through_the_store() {
        let (raw, service) = fixture().await;
        let store = EncryptedFileStore::new(raw, service);

        let mut buf = Vec::new();
        cat(&store, "conf/app.json.encrypted", &mut buf).await.expect("cat");
        assert_eq!(buf, b"s3cret");

        let mut buf = Vec::new();
        key(&store, "conf/app.json.encrypted", &mut buf).await.expect("key");
        assert_eq!(output(buf), format!("{}\n", key_ref()));
    }

    #[tokio::test]
    async fn cat_surfaces_missing_key_material() {
        let (raw, service) = fixture().await;
        let store = EncryptedFileStore::new(raw, service);
        let err = cat(&store, "conf/lonely.encrypted", &mut Vec::new())
            .await
            .expect_err("missing keyname");
        assert!(matches!(
            err.downcast_ref::<FileStoreError>(),
            Some(FileStoreError::MissingKeyMaterial { .. })
        ));
    }

    #[tokio::test]
    async fn check_reports_unpaired_and_malformed_files() {
        let (raw, _service) = fixture().await;
        raw.insert_file("conf/sub/bad.encrypted", b"x".to_vec()).expect("insert");
        raw.insert_file("conf/sub/bad.keyname", b"# only a comment\n".to_vec())
            .expect("insert");
        raw.insert_file("conf/sub/stale.keyname", key_ref().to_string()).expect("insert");

        let shallow = check(&raw, "conf", false).await.expect("check");
        assert_eq!(
            shallow,
            vec![Problem::MissingKeyName {
                ciphertext: "conf/lonely.encrypted".into(),
                keyname: "conf/lonely.keyname".into(),
            }]
        );

        let deep = check(&raw, "conf", true).await.expect("check");
        assert_eq!(deep.len(), 3);
        assert!(deep.iter().any(|p| matches!(
            p,
            Problem::MalformedKeyName { path, .. } if path == "conf/sub/bad.keyname"
        )));
        assert!(deep.contains(&Problem::OrphanKeyName {
            path: "conf/sub/stale.keyname".into()
        }));
    }

    #[tokio::test]
    async fn check_flags_non_utf8_keynames() {
        let raw = InMemoryFileStore::new();
        raw.insert_file("a.encrypted", b"x".to_vec()).expect("insert");
        raw.insert_file("a.keyname", vec![0xff, 0xfe, 0x00]).expect("insert");
        let problems = check(&raw, "", false).await.expect("check");
        assert_eq!(
            problems,
            vec![Problem::MalformedKeyName {
                path: "a.keyname".into(),
                reason: "not valid UTF-8".into(),
            }]
        );
    }

    #[tokio::test]
    async fn seal_writes_a_pair_the_store_can_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("plain.txt");
        fs::write(&source, b"top secret").expect("write");
        let service = test_service();

        let out = seal_dir(None, &dir.path().join("sealed"));
        let pair = seal(service.as_ref(), &source, &key_ref(), &out, None)
            .await
            .expect("seal");
        assert!(pair.ciphertext.ends_with("sealed/plain.txt.encrypted"));

        let store = EncryptedFileStore::new(PhysicalFileStore::new(dir.path()), service);
        let mut buf = Vec::new();
        cat(&store, "sealed/plain.txt.encrypted", &mut buf).await.expect("cat");
        assert_eq!(buf, b"top secret");
    }

    #[tokio::test]
    async fn seal_uses_an_explicit_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("plain.txt");
        fs::write(&source, b"x").expect("write");
        let service = test_service();

        let pair = seal(service.as_ref(), &source, &key_ref(), dir.path(), Some("renamed"))
            .await
            .expect("seal");
        assert!(pair.keyname.ends_with("renamed.keyname"));
    }
}
