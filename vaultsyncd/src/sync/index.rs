use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use tracing::debug;

use super::lock;
use super::paths::list_vault_files;

pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Durable identity of one file inside a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub relative_path: String,
    pub file_id: String,
    /// SHA-256 of the last committed content; `None` until first commit.
    pub content_hash: Option<String>,
    pub size: Option<i64>,
    pub modified: Option<i64>,
}

/// A committed change to persist into the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexChange {
    Upsert(IndexEntry),
    Remove { relative_path: String },
}

pub struct FileIndex {
    pool: SqlitePool,
    cache: Mutex<HashMap<String, HashMap<String, IndexEntry>>>,
}

impl FileIndex {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let index = Self::from_pool(pool);
        index.init().await?;
        Ok(index)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Reads every mapping of `vault` into the cache and returns the count.
    pub async fn load(&self, vault: &Path) -> Result<usize, IndexError> {
        let key = vault_key(vault);
        let rows = sqlx::query(
            "SELECT relative_path, file_id, content_hash, size, modified
             FROM file_index
             WHERE vault_path = ?1",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let entry = IndexEntry {
                relative_path: row.try_get("relative_path")?,
                file_id: row.try_get("file_id")?,
                content_hash: row.try_get("content_hash")?,
                size: row.try_get("size")?,
                modified: row.try_get("modified")?,
            };
            entries.insert(entry.relative_path.clone(), entry);
        }
        let count = entries.len();
        lock(&self.cache).insert(key, entries);
        Ok(count)
    }

    pub async fn entries(&self, vault: &Path) -> Result<HashMap<String, IndexEntry>, IndexError> {
        let key = vault_key(vault);
        if let Some(entries) = lock(&self.cache).get(&key) {
            return Ok(entries.clone());
        }
        self.load(vault).await?;
        Ok(lock(&self.cache).get(&key).cloned().unwrap_or_default())
    }

    pub async fn file_id(
        &self,
        vault: &Path,
        relative_path: &str,
    ) -> Result<Option<String>, IndexError> {
        Ok(self
            .entries(vault)
            .await?
            .get(relative_path)
            .map(|entry| entry.file_id.clone()))
    }

    /// Assigns ids to files that are on disk but not yet indexed. Existing
    /// mappings are left untouched, so repeated scans are no-ops.
    pub async fn scan_and_create_ids(&self, vault: &Path) -> Result<usize, IndexError> {
        let known = self.entries(vault).await?;
        let root: PathBuf = vault.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_vault_files(&root)).await??;

        let key = vault_key(vault);
        let mut created = Vec::new();
        let mut tx = self.pool.begin().await?;
        for file in files {
            if known.contains_key(&file.relative_path) {
                continue;
            }
            let entry = IndexEntry {
                relative_path: file.relative_path,
                file_id: uuid::Uuid::new_v4().to_string(),
                content_hash: None,
                size: Some(file.size as i64),
                modified: file.modified,
            };
            upsert_row(&mut tx, &key, &entry).await?;
            created.push(entry);
        }
        tx.commit().await?;

        let count = created.len();
        if count > 0 {
            let mut cache = lock(&self.cache);
            let entries = cache.entry(key).or_default();
            for entry in created {
                entries.insert(entry.relative_path.clone(), entry);
            }
        }
        debug!(vault = %vault.display(), created = count, "file ids backfilled");
        Ok(count)
    }

    /// Re-keys the mapping of `from` to `to`, replacing any mapping already at
    /// `to`. Returns the moved file id.
    pub async fn move_path(
        &self,
        vault: &Path,
        from: &str,
        to: &str,
    ) -> Result<Option<String>, IndexError> {
        let entries = self.entries(vault).await?;
        let Some(existing) = entries.get(from).cloned() else {
            return Ok(None);
        };
        let key = vault_key(vault);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_index WHERE vault_path = ?1 AND relative_path = ?2")
            .bind(&key)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE file_index SET relative_path = ?3 WHERE vault_path = ?1 AND relative_path = ?2",
        )
        .bind(&key)
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut cache = lock(&self.cache);
        if let Some(entries) = cache.get_mut(&key) {
            entries.remove(from);
            entries.insert(
                to.to_string(),
                IndexEntry {
                    relative_path: to.to_string(),
                    ..existing.clone()
                },
            );
        }
        Ok(Some(existing.file_id))
    }

    pub async fn delete(
        &self,
        vault: &Path,
        relative_path: &str,
    ) -> Result<Option<String>, IndexError> {
        let key = vault_key(vault);
        let removed = self.file_id(vault, relative_path).await?;
        sqlx::query("DELETE FROM file_index WHERE vault_path = ?1 AND relative_path = ?2")
            .bind(&key)
            .bind(relative_path)
            .execute(&self.pool)
            .await?;
        if let Some(entries) = lock(&self.cache).get_mut(&key) {
            entries.remove(relative_path);
        }
        Ok(removed)
    }

    /// Persists committed changes in one transaction.
    pub async fn apply_changes(
        &self,
        vault: &Path,
        changes: &[IndexChange],
    ) -> Result<(), IndexError> {
        if changes.is_empty() {
            return Ok(());
        }
        // Make sure the cache reflects the database before patching it.
        self.entries(vault).await?;
        let key = vault_key(vault);

        let mut tx = self.pool.begin().await?;
        for change in changes {
            match change {
                IndexChange::Upsert(entry) => {
                    // A file id lives at exactly one path.
                    sqlx::query(
                        "DELETE FROM file_index
                         WHERE vault_path = ?1 AND file_id = ?2 AND relative_path != ?3",
                    )
                    .bind(&key)
                    .bind(&entry.file_id)
                    .bind(&entry.relative_path)
                    .execute(&mut *tx)
                    .await?;
                    upsert_row(&mut tx, &key, entry).await?;
                }
                IndexChange::Remove { relative_path } => {
                    sqlx::query(
                        "DELETE FROM file_index WHERE vault_path = ?1 AND relative_path = ?2",
                    )
                    .bind(&key)
                    .bind(relative_path)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;

        let mut cache = lock(&self.cache);
        let entries = cache.entry(key).or_default();
        for change in changes {
            match change {
                IndexChange::Upsert(entry) => {
                    entries.retain(|path, existing| {
                        existing.file_id != entry.file_id || *path == entry.relative_path
                    });
                    entries.insert(entry.relative_path.clone(), entry.clone());
                }
                IndexChange::Remove { relative_path } => {
                    entries.remove(relative_path);
                }
            }
        }
        Ok(())
    }

    pub fn clear_cache(&self, vault: &Path) {
        lock(&self.cache).remove(&vault_key(vault));
    }

    pub fn is_cached(&self, vault: &Path) -> bool {
        lock(&self.cache).contains_key(&vault_key(vault))
    }
}

async fn upsert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    vault_key: &str,
    entry: &IndexEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO file_index (vault_path, relative_path, file_id, content_hash, size, modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(vault_path, relative_path) DO UPDATE SET
             file_id = excluded.file_id,
             content_hash = excluded.content_hash,
             size = excluded.size,
             modified = excluded.modified",
    )
    .bind(vault_key)
    .bind(&entry.relative_path)
    .bind(&entry.file_id)
    .bind(&entry.content_hash)
    .bind(entry.size)
    .bind(entry.modified)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) fn vault_key(vault: &Path) -> String {
    vault.to_string_lossy().into_owned()
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
