pub mod binding_store;
pub mod membership_store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("invalid stored payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("membership not found")]
    MembershipNotFound,
}
