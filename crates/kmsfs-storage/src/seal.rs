use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
};

use kmsfs_core::{
    files::FileStoreError,
    kms::{KeyEncryptor, KeyReference},
};
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};

use crate::encrypted::{ENCRYPTED_EXTENSION, KEYNAME_EXTENSION};

/// Files written by [`seal_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPair {
    pub ciphertext: PathBuf,
    pub keyname: PathBuf,
}

/// Encrypt `plaintext` under `key` and write `<name>.encrypted` plus its
/// `<name>.keyname` companion into `dir`.
#[instrument(skip_all, fields(name = %name, key = %key))]
pub async fn seal_file<K>(
    dir: &Path,
    name: &str,
    key: &KeyReference,
    plaintext: &[u8],
    encryptor: &K,
) -> Result<SealedPair, FileStoreError>
where
    K: KeyEncryptor + ?Sized,
{
    let mut components = Path::new(name).components();
    if !matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) {
        return Err(FileStoreError::Storage {
            reason: format!("invalid file name: {name:?}"),
        });
    }

    let ciphertext = encryptor.encrypt(key, plaintext).await?;

    let pair = SealedPair {
        ciphertext: dir.join(format!("{name}{ENCRYPTED_EXTENSION}")),
        keyname: dir.join(format!("{name}{KEYNAME_EXTENSION}")),
    };
    fs::create_dir_all(dir).map_err(FileStoreError::storage)?;
    let staged_ciphertext = stage(dir, &ciphertext)?;
    let staged_keyname = stage(dir, keyname_contents(name, key).as_bytes())?;

    persist(staged_ciphertext, &pair.ciphertext)?;
    if let Err(err) = persist(staged_keyname, &pair.keyname) {
        // A ciphertext without its key name file would be unreadable.
        if let Err(remove_err) = fs::remove_file(&pair.ciphertext) {
            warn!(path = %pair.ciphertext.display(), %remove_err, "could not remove unpaired ciphertext");
        }
        return Err(err);
    }
    info!(path = %pair.ciphertext.display(), "sealed file");
    Ok(pair)
}

fn keyname_contents(name: &str, key: &KeyReference) -> String {
    format!("# key for {name}{ENCRYPTED_EXTENSION}\n{key}\n")
}

fn stage(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile, FileStoreError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(FileStoreError::storage)?;
    tmp.write_all(bytes).map_err(FileStoreError::storage)?;
    tmp.flush().map_err(FileStoreError::storage)?;
    Ok(tmp)
}

fn persist(tmp: NamedTempFile, path: &Path) -> Result<(), FileStoreError> {
    tmp.persist(path)
        .map_err(|e| FileStoreError::storage(e.error))?;
    Ok(())
}
