//! First-use vault binding and account-switch conflict handling.
//!
//! The auto-binder never calls back into the engine. Recovery after a failed
//! first attempt is announced as a [`BindingEvent`] that the engine listens
//! for.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vaultsync_core::{ApiError, BindVaultRequest, CloudSyncClient};

use super::backoff::Backoff;
use super::index::vault_key;
use super::lock;
use crate::storage::StorageError;
use crate::storage::binding_store::{Binding, BindingStore};

const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(300);
const RETRY_ATTEMPTS: u32 = 8;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEvent {
    Recovered { vault_path: PathBuf },
}

pub struct AutoBinder {
    store: BindingStore,
    backoff: Backoff,
    events: broadcast::Sender<BindingEvent>,
    retries: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AutoBinder {
    pub fn new(store: BindingStore) -> Self {
        Self::with_backoff(
            store,
            Backoff::new(RETRY_BASE, RETRY_MAX, true).with_max_attempts(RETRY_ATTEMPTS),
        )
    }

    pub fn with_backoff(store: BindingStore, backoff: Backoff) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            store,
            backoff,
            events,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &BindingStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BindingEvent> {
        self.events.subscribe()
    }

    pub async fn try_auto_binding(
        &self,
        client: &CloudSyncClient,
        vault: &Path,
        device_id: &str,
    ) -> Result<Binding, BindingError> {
        bind_remote(&self.store, client, vault, device_id).await
    }

    /// Keeps retrying in the background until a binding sticks or the
    /// attempts run out. Replaces any retry already running for `vault`.
    pub fn schedule_retry(&self, client: CloudSyncClient, vault: PathBuf, device_id: String) {
        let store = self.store.clone();
        let backoff = self.backoff;
        let events = self.events.clone();
        let key = vault_key(&vault);

        let handle = tokio::spawn(async move {
            let mut attempt = 0;
            while let Some(delay) = backoff.next_delay(attempt) {
                tokio::time::sleep(delay).await;
                attempt += 1;
                match bind_remote(&store, &client, &vault, &device_id).await {
                    Ok(binding) => {
                        info!(
                            vault = %vault.display(),
                            vault_id = %binding.vault_id,
                            attempt,
                            "auto binding recovered"
                        );
                        let _ = events.send(BindingEvent::Recovered { vault_path: vault });
                        return;
                    }
                    Err(err) => {
                        warn!(vault = %vault.display(), attempt, err = %err, "auto binding retry failed");
                    }
                }
            }
            warn!(vault = %vault.display(), attempt, "auto binding retries exhausted");
        });

        if let Some(previous) = lock(&self.retries).insert(key, handle) {
            previous.abort();
        }
    }

    pub fn is_retrying(&self, vault: &Path) -> bool {
        lock(&self.retries)
            .get(&vault_key(vault))
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel_retries(&self) {
        for (_, handle) in lock(&self.retries).drain() {
            handle.abort();
        }
    }
}

impl Drop for AutoBinder {
    fn drop(&mut self) {
        self.cancel_retries();
    }
}

async fn bind_remote(
    store: &BindingStore,
    client: &CloudSyncClient,
    vault: &Path,
    device_id: &str,
) -> Result<Binding, BindingError> {
    let vault_name = vault
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| vault_key(vault));
    let remote = client
        .bind_vault(&BindVaultRequest {
            vault_name,
            device_id: device_id.to_string(),
        })
        .await?;
    let binding = Binding::new(vault, &remote.id, device_id, &remote.account_id);
    store.save(&binding).await?;
    Ok(binding)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResolution {
    StayOffline,
    SyncToCurrent,
}

impl fmt::Display for BindingResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindingResolution::StayOffline => "stay_offline",
            BindingResolution::SyncToCurrent => "sync_to_current",
        })
    }
}

impl FromStr for BindingResolution {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stay_offline" => Ok(BindingResolution::StayOffline),
            "sync_to_current" => Ok(BindingResolution::SyncToCurrent),
            other => Err(format!("unknown binding resolution: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingConflict {
    pub vault_path: PathBuf,
    pub vault_id: String,
    pub bound_account_id: String,
    pub current_account_id: String,
}

/// Asks whoever is in charge how to handle a vault bound to another account.
#[async_trait]
pub trait BindingPrompt: Send + Sync {
    async fn resolve(&self, conflict: &BindingConflict) -> BindingResolution;
}

/// Always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolution(pub BindingResolution);

#[async_trait]
impl BindingPrompt for FixedResolution {
    async fn resolve(&self, _conflict: &BindingConflict) -> BindingResolution {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    NoConflict,
    StayOffline(BindingConflict),
    /// The stale binding has been deleted; the caller should bind again.
    SyncToCurrent,
}

pub async fn check_and_resolve_binding_conflict(
    store: &BindingStore,
    vault: &Path,
    current_account_id: &str,
    prompt: &dyn BindingPrompt,
) -> Result<ConflictCheck, BindingError> {
    let Some(binding) = store.get(vault).await? else {
        return Ok(ConflictCheck::NoConflict);
    };
    if binding.account_id == current_account_id {
        return Ok(ConflictCheck::NoConflict);
    }

    let conflict = BindingConflict {
        vault_path: vault.to_path_buf(),
        vault_id: binding.vault_id,
        bound_account_id: binding.account_id,
        current_account_id: current_account_id.to_string(),
    };
    let resolution = prompt.resolve(&conflict).await;
    info!(
        vault = %vault.display(),
        bound = %conflict.bound_account_id,
        current = %conflict.current_account_id,
        %resolution,
        "binding conflict resolved"
    );
    match resolution {
        BindingResolution::StayOffline => Ok(ConflictCheck::StayOffline(conflict)),
        BindingResolution::SyncToCurrent => {
            store.delete(vault).await?;
            Ok(ConflictCheck::SyncToCurrent)
        }
    }
}
