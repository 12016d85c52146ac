//! Whole-file conflict handling: the remote version keeps the original path
//! and the local bytes move aside to a sibling "conflict copy".

use std::io;
use std::path::Path;

use super::paths::{PathError, vault_path_for};

/// Sibling name for a conflicting local copy: `notes/a (conflict 1700000000).md`.
pub fn conflict_copy_path(relative_path: &str, stamp: i64) -> String {
    let (dir, name) = match relative_path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), relative_path),
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} (conflict {stamp}).{ext}");
    }

    format!("{dir}{name} (conflict {stamp})")
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Picks an unused conflict-copy name for `relative_path`, or `None` when
/// there is no local file to preserve. Nothing is moved.
pub async fn free_conflict_copy(
    vault_root: &Path,
    relative_path: &str,
    stamp: i64,
) -> Result<Option<String>, ConflictError> {
    let source = vault_path_for(vault_root, relative_path)?;
    match tokio::fs::metadata(&source).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let mut attempt = 0i64;
    loop {
        let candidate = conflict_copy_path(relative_path, stamp + attempt);
        let target = vault_path_for(vault_root, &candidate)?;
        if !tokio::fs::try_exists(&target).await? {
            return Ok(Some(candidate));
        }
        attempt += 1;
    }
}

/// Renames `from` to `to`, both relative to the vault.
pub async fn move_within_vault(vault_root: &Path, from: &str, to: &str) -> Result<(), ConflictError> {
    let source = vault_path_for(vault_root, from)?;
    let target = vault_path_for(vault_root, to)?;
    tokio::fs::rename(&source, &target).await?;
    Ok(())
}
