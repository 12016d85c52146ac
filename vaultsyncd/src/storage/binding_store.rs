use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;

use super::StorageError;
use crate::sync::index::{MIGRATOR, vault_key};

/// Durable association of a local vault with a remote vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub vault_path: PathBuf,
    pub vault_id: String,
    pub device_id: String,
    /// Remote account that created the binding.
    pub account_id: String,
    pub created_at: i64,
}

impl Binding {
    pub fn new(vault_path: &Path, vault_id: &str, device_id: &str, account_id: &str) -> Self {
        Self {
            vault_path: vault_path.to_path_buf(),
            vault_id: vault_id.to_string(),
            device_id: device_id.to_string(),
            account_id: account_id.to_string(),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

#[derive(Clone)]
pub struct BindingStore {
    pool: SqlitePool,
}

impl BindingStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, vault_path: &Path) -> Result<Option<Binding>, StorageError> {
        let row = sqlx::query(
            "SELECT vault_id, device_id, account_id, created_at
             FROM bindings
             WHERE vault_path = ?1",
        )
        .bind(vault_key(vault_path))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Binding {
            vault_path: vault_path.to_path_buf(),
            vault_id: row.try_get("vault_id")?,
            device_id: row.try_get("device_id")?,
            account_id: row.try_get("account_id")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    /// Stores `binding`, replacing whatever the vault was bound to before.
    pub async fn save(&self, binding: &Binding) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO bindings (vault_path, vault_id, device_id, account_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(vault_path) DO UPDATE SET
                 vault_id = excluded.vault_id,
                 device_id = excluded.device_id,
                 account_id = excluded.account_id,
                 created_at = excluded.created_at",
        )
        .bind(vault_key(&binding.vault_path))
        .bind(&binding.vault_id)
        .bind(&binding.device_id)
        .bind(&binding.account_id)
        .bind(binding.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, vault_path: &Path) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM bindings WHERE vault_path = ?1")
            .bind(vault_key(vault_path))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
