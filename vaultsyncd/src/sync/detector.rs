use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use vaultsync_core::{ChangeType, LocalFileChange};

use super::index::{FileIndex, IndexEntry, IndexError, vault_key};
use super::lock;
use super::paths::{LocalFile, PathError, list_vault_files, vault_path_for};
use super::state::PendingChange;
use super::transfer::file_digest;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Output of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct DetectedChanges {
    /// Wire manifest for `syncDiff`, sorted by path.
    pub dtos: Vec<LocalFileChange>,
    /// Every path this pass accounted for: the pending paths it was handed
    /// plus anything it found changed on disk.
    pub pending_changes: HashMap<String, PendingChange>,
}

impl DetectedChanges {
    pub fn is_empty(&self) -> bool {
        self.dtos.is_empty() && self.pending_changes.is_empty()
    }
}

/// Compares the vault tree with the file index without mutating it.
///
/// Untracked files receive provisional ids that stay stable across passes
/// until a commit persists them into the index.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    provisional: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn detect_local_changes(
        &self,
        index: &FileIndex,
        vault: &Path,
        pending: &[PendingChange],
    ) -> Result<DetectedChanges, DetectError> {
        let entries = index.entries(vault).await?;
        let root: PathBuf = vault.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_vault_files(&root)).await??;
        let pending: HashMap<&str, &PendingChange> = pending
            .iter()
            .map(|change| (change.relative_path.as_str(), change))
            .collect();

        let now = OffsetDateTime::now_utc();
        let mut detected = DetectedChanges::default();
        let mut on_disk = HashSet::with_capacity(files.len());

        for file in files {
            let is_pending = pending.contains_key(file.relative_path.as_str());
            let entry = entries.get(&file.relative_path);
            if !is_pending && entry.is_some_and(|entry| is_unchanged_fast(entry, &file)) {
                on_disk.insert(file.relative_path);
                continue;
            }

            let absolute = vault_path_for(vault, &file.relative_path)?;
            let digest = match file_digest(&absolute).await {
                Ok(digest) => digest,
                // Removed between the listing and the read.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            on_disk.insert(file.relative_path.clone());

            // Pending paths are reported even when the content is unchanged so
            // the server sees renames of committed files.
            if !is_pending
                && entry.is_some_and(|entry| {
                    entry.content_hash.as_deref() == Some(digest.content_hash.as_str())
                })
            {
                continue;
            }

            let file_id = match entry {
                Some(entry) => entry.file_id.clone(),
                None => self.provisional_id(vault, &file.relative_path),
            };
            detected.dtos.push(LocalFileChange {
                file_id,
                relative_path: file.relative_path.clone(),
                change_type: ChangeType::Upload,
                content_hash: Some(digest.content_hash),
                size: Some(digest.size),
                modified_at: file.modified,
            });
            detected.pending_changes.insert(
                file.relative_path.clone(),
                PendingChange {
                    relative_path: file.relative_path,
                    change_type: ChangeType::Upload,
                    detected_at: now,
                },
            );
        }

        for entry in entries.values() {
            if on_disk.contains(&entry.relative_path) {
                continue;
            }
            detected.dtos.push(LocalFileChange {
                file_id: entry.file_id.clone(),
                relative_path: entry.relative_path.clone(),
                change_type: ChangeType::Delete,
                content_hash: None,
                size: None,
                modified_at: None,
            });
            detected.pending_changes.insert(
                entry.relative_path.clone(),
                PendingChange {
                    relative_path: entry.relative_path.clone(),
                    change_type: ChangeType::Delete,
                    detected_at: now,
                },
            );
        }

        for (path, change) in pending {
            if !on_disk.contains(path) && !entries.contains_key(path) {
                debug!(path, "pending path vanished before it was ever indexed");
                self.forget_provisional(vault, [path]);
            }
            detected
                .pending_changes
                .entry(path.to_string())
                .or_insert_with(|| (*change).clone());
        }

        detected
            .dtos
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(detected)
    }

    /// Returns the in-memory id for an untracked path, creating one if needed.
    pub fn provisional_id(&self, vault: &Path, relative_path: &str) -> String {
        lock(&self.provisional)
            .entry(vault_key(vault))
            .or_default()
            .entry(relative_path.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub fn move_provisional(&self, vault: &Path, from: &str, to: &str) {
        let mut provisional = lock(&self.provisional);
        if let Some(ids) = provisional.get_mut(&vault_key(vault))
            && let Some(id) = ids.remove(from)
        {
            ids.insert(to.to_string(), id);
        }
    }

    pub fn forget_provisional<'a>(&self, vault: &Path, paths: impl IntoIterator<Item = &'a str>) {
        let mut provisional = lock(&self.provisional);
        if let Some(ids) = provisional.get_mut(&vault_key(vault)) {
            for path in paths {
                ids.remove(path);
            }
        }
    }

    pub fn clear(&self, vault: &Path) {
        lock(&self.provisional).remove(&vault_key(vault));
    }
}

fn is_unchanged_fast(entry: &IndexEntry, file: &LocalFile) -> bool {
    entry.content_hash.is_some()
        && entry.size == Some(file.size as i64)
        && entry.modified.is_some()
        && entry.modified == file.modified
}
