use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vaultsync_core::ChangeType;

use super::activity::{ActivityKind, ActivitySummary, ActivityTracker};
use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Disabled,
    Offline,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Disabled => "disabled",
            SyncStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation waiting for the next successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub relative_path: String,
    pub change_type: ChangeType,
    pub detected_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatusSnapshot {
    pub status: SyncStatus,
    pub vault_path: Option<PathBuf>,
    pub vault_id: Option<String>,
    pub last_sync_at: Option<OffsetDateTime>,
    pub error: Option<String>,
    pub pending_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDetail {
    pub snapshot: SyncStatusSnapshot,
    pub activity: ActivitySummary,
}

#[derive(Debug, Default)]
struct StateInner {
    status: SyncStatus,
    vault_path: Option<PathBuf>,
    vault_id: Option<String>,
    last_sync_at: Option<OffsetDateTime>,
    error: Option<String>,
    pending: BTreeMap<String, PendingChange>,
}

impl StateInner {
    fn snapshot(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            status: self.status,
            vault_path: self.vault_path.clone(),
            vault_id: self.vault_id.clone(),
            last_sync_at: self.last_sync_at,
            error: self.error.clone(),
            pending_paths: self.pending.keys().cloned().collect(),
        }
    }
}

/// Single mutable source of truth for engine status. Mutators never
/// broadcast on their own; the engine calls [`SyncState::broadcast`] once a
/// transition is complete.
pub struct SyncState {
    inner: Mutex<StateInner>,
    activity: Arc<ActivityTracker>,
    tx: watch::Sender<SyncStatusSnapshot>,
}

impl SyncState {
    pub fn new(activity: Arc<ActivityTracker>) -> Self {
        let (tx, _rx) = watch::channel(SyncStatusSnapshot::default());
        Self {
            inner: Mutex::new(StateInner::default()),
            activity,
            tx,
        }
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        lock(&self.inner).snapshot()
    }

    pub fn detail(&self) -> StatusDetail {
        StatusDetail {
            snapshot: self.snapshot(),
            activity: self.activity.summary(),
        }
    }

    pub fn broadcast(&self) {
        self.tx.send_replace(self.snapshot());
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.inner).status
    }

    pub fn vault_path(&self) -> Option<PathBuf> {
        lock(&self.inner).vault_path.clone()
    }

    pub fn vault_id(&self) -> Option<String> {
        lock(&self.inner).vault_id.clone()
    }

    pub fn set_vault(&self, path: &Path, vault_id: Option<String>) {
        let mut inner = lock(&self.inner);
        inner.vault_path = Some(path.to_path_buf());
        inner.vault_id = vault_id;
    }

    pub fn set_status(&self, status: SyncStatus) {
        lock(&self.inner).status = status;
    }

    pub fn set_error(&self, error: Option<String>) {
        lock(&self.inner).error = error;
    }

    /// Enters `syncing` and clears the previous attempt's error.
    pub fn begin_sync(&self) {
        let mut inner = lock(&self.inner);
        inner.status = SyncStatus::Syncing;
        inner.error = None;
    }

    pub fn record_sync(&self, at: OffsetDateTime) {
        lock(&self.inner).last_sync_at = Some(at);
    }

    pub fn add_pending(&self, relative_path: &str, change_type: ChangeType) {
        lock(&self.inner).pending.insert(
            relative_path.to_string(),
            PendingChange {
                relative_path: relative_path.to_string(),
                change_type,
                detected_at: OffsetDateTime::now_utc(),
            },
        );
        let kind = match change_type {
            ChangeType::Upload => ActivityKind::Upload,
            ChangeType::Delete => ActivityKind::Delete,
        };
        self.activity.add_pending(relative_path, kind);
    }

    pub fn remove_pending(&self, relative_path: &str) {
        lock(&self.inner).pending.remove(relative_path);
        self.activity.remove(relative_path);
    }

    pub fn pending_changes(&self) -> Vec<PendingChange> {
        lock(&self.inner).pending.values().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.inner).pending.is_empty()
    }

    /// True when some pending change was marked after `since`.
    pub fn has_pending_since(&self, since: OffsetDateTime) -> bool {
        lock(&self.inner)
            .pending
            .values()
            .any(|change| change.detected_at > since)
    }

    /// Clears the given paths from both pending sets, keeping entries that
    /// were re-marked after `since`.
    pub fn clear_pending(&self, paths: &[String], since: OffsetDateTime) {
        let mut inner = lock(&self.inner);
        let mut cleared = Vec::with_capacity(paths.len());
        for path in paths {
            if inner
                .pending
                .get(path)
                .is_some_and(|change| change.detected_at <= since)
            {
                inner.pending.remove(path);
                cleared.push(path.as_str());
            }
        }
        drop(inner);
        self.activity.clear_pending(cleared);
    }

    /// Back to the state of a freshly constructed engine.
    pub fn reset(&self) {
        *lock(&self.inner) = StateInner::default();
        self.activity.reset();
    }
}

/// Live status listener; delivery stops when this is dropped.
pub struct StatusSubscription {
    handle: JoinHandle<()>,
}

impl StatusSubscription {
    pub(crate) fn spawn<F>(mut rx: watch::Receiver<SyncStatusSnapshot>, mut listener: F) -> Self
    where
        F: FnMut(SyncStatusSnapshot) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                listener(snapshot);
            }
        });
        Self { handle }
    }

    pub fn unsubscribe(self) {
        self.handle.abort();
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
