use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vaultsync_core::{
    ApiError, ChangeType, CloudSyncClient, SyncActionType, SyncCommitRequest, SyncDiffRequest,
    VectorizeRequest,
};

use super::activity::ActivityKind;
use super::binding::{
    AutoBinder, BindingError, BindingEvent, BindingPrompt, BindingResolution, ConflictCheck,
    FixedResolution, check_and_resolve_binding_conflict,
};
use super::detector::{ChangeDetector, DetectError};
use super::executor::{
    ActionOutcome, ActionProgress, ExecutionContext, ExecutionResult,
    execute_actions_with_tracking,
};
use super::index::{FileIndex, IndexChange, IndexEntry, IndexError};
use super::lock;
use super::paths::{is_ignored, modified_unix, vault_path_for};
use super::scheduler::Scheduler;
use super::state::{StatusDetail, StatusSubscription, SyncState, SyncStatus, SyncStatusSnapshot};
use super::transfer::TransferClient;
use crate::membership::MembershipSource;
use crate::settings::{SettingsError, SettingsSource, SyncSettings};
use crate::storage::StorageError;
use crate::storage::binding_store::BindingStore;

const DEFAULT_API_URL: &str = "https://api.vaultsync.app";
const BOUND_ELSEWHERE: &str = "vault is bound to a different account";
const AUTO_BINDING_FAILED: &str = "auto binding failed, will retry later";
/// Watcher events for paths the engine itself wrote are dropped this long
/// after the write.
const ECHO_WINDOW: Duration = Duration::from_secs(2);
/// Shortest wait before paths left pending by failed actions are retried.
const RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("change detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("binding error: {0}")]
    Binding(#[from] BindingError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
}

impl EngineError {
    fn api(&self) -> Option<&ApiError> {
        match self {
            EngineError::Api(err) | EngineError::Binding(BindingError::Api(err)) => Some(err),
            _ => None,
        }
    }

    /// Status a failed sync attempt leaves the engine in.
    pub fn status_after_failure(&self) -> SyncStatus {
        match self.api() {
            Some(err) if err.is_unauthorized() => SyncStatus::Disabled,
            Some(err) if err.is_server_error() || err.is_network_error() => SyncStatus::Offline,
            _ => SyncStatus::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub sync_debounce: Duration,
    pub vectorize_debounce: Duration,
    /// A sync holding the lock longer than this is considered hung.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            sync_debounce: Duration::from_millis(2000),
            vectorize_debounce: Duration::from_millis(5000),
            lock_timeout: Duration::from_secs(300),
        }
    }
}

/// Raw change reported by a filesystem watcher, relative to the vault root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Add(String),
    Change(String),
    Unlink(String),
    Rename { from: Option<String>, to: String },
}

pub struct EngineDeps {
    pub index: FileIndex,
    pub bindings: BindingStore,
    pub membership: Arc<dyn MembershipSource>,
    pub settings: Arc<dyn SettingsSource>,
    pub prompt: Arc<dyn BindingPrompt>,
    pub transfer: TransferClient,
}

impl EngineDeps {
    pub fn new(
        index: FileIndex,
        bindings: BindingStore,
        membership: Arc<dyn MembershipSource>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            index,
            bindings,
            membership,
            settings,
            prompt: Arc::new(FixedResolution(BindingResolution::StayOffline)),
            transfer: TransferClient::new(),
        }
    }
}

#[derive(Default)]
struct SyncLock {
    held: bool,
    acquired_at: Option<Instant>,
    generation: u64,
    abort: Option<AbortHandle>,
}

impl SyncLock {
    fn is_stale(&self, timeout: Duration) -> bool {
        self.acquired_at
            .is_some_and(|acquired| acquired.elapsed() >= timeout)
    }

    fn release(&mut self) {
        self.held = false;
        self.acquired_at = None;
        self.abort = None;
    }
}

/// Releases the sync lock when the attempt ends, however it ends. A newer
/// generation means the lock was taken over and is left alone.
struct LockRelease<'a> {
    lock: &'a Mutex<SyncLock>,
    generation: u64,
}

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        let mut sync_lock = lock(self.lock);
        if sync_lock.generation == self.generation {
            sync_lock.release();
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    index: FileIndex,
    detector: ChangeDetector,
    transfer: TransferClient,
    binder: AutoBinder,
    membership: Arc<dyn MembershipSource>,
    settings: Arc<dyn SettingsSource>,
    prompt: Arc<dyn BindingPrompt>,
    state: SyncState,
    scheduler: Scheduler,
    sync_lock: Mutex<SyncLock>,
    client: Mutex<Option<CloudSyncClient>>,
    recent_writes: Mutex<HashMap<String, Instant>>,
    binding_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.binding_listener).take() {
            listener.abort();
        }
    }
}

/// Orchestrates detection, diff, execution and commit for one vault at a
/// time. Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct CloudSyncEngine {
    inner: Arc<EngineInner>,
}

impl CloudSyncEngine {
    /// Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let state = SyncState::new(Arc::new(super::activity::ActivityTracker::new()));
        let binder = AutoBinder::new(deps.bindings);
        let events = binder.subscribe();
        let inner = Arc::new(EngineInner {
            config,
            index: deps.index,
            detector: ChangeDetector::new(),
            transfer: deps.transfer,
            binder,
            membership: deps.membership,
            settings: deps.settings,
            prompt: deps.prompt,
            state,
            scheduler: Scheduler::new(),
            sync_lock: Mutex::new(SyncLock::default()),
            client: Mutex::new(None),
            recent_writes: Mutex::new(HashMap::new()),
            binding_listener: Mutex::new(None),
        });
        let listener = tokio::spawn(listen_for_binding_events(Arc::downgrade(&inner), events));
        *lock(&inner.binding_listener) = Some(listener);
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn index(&self) -> &FileIndex {
        &self.inner.index
    }

    pub fn bindings(&self) -> &BindingStore {
        self.inner.binder.store()
    }

    /// Startup negotiation for `vault`. Degraded outcomes (disabled, signed
    /// out, bound elsewhere, binding failed) are reported through the status,
    /// not as errors.
    pub async fn init(&self, vault: &Path) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner
            .state
            .vault_path()
            .is_some_and(|current| current != vault)
        {
            self.stop();
        }
        let vault = vault.to_path_buf();
        let settings = inner.settings.load()?;

        if !settings.sync_enabled {
            info!(vault = %vault.display(), "sync disabled in settings");
            self.enter_degraded(&vault, SyncStatus::Disabled, None);
            return Ok(());
        }
        let Some(membership) = inner.membership.config() else {
            info!(vault = %vault.display(), "no membership token, sync disabled");
            self.enter_degraded(&vault, SyncStatus::Disabled, None);
            return Ok(());
        };

        let client =
            CloudSyncClient::with_base_url(&inner.config.api_base_url, membership.token)?;
        *lock(&inner.client) = Some(client.clone());

        let check = check_and_resolve_binding_conflict(
            inner.binder.store(),
            &vault,
            &membership.account_id,
            inner.prompt.as_ref(),
        )
        .await?;
        if let ConflictCheck::StayOffline(conflict) = check {
            warn!(
                vault = %vault.display(),
                bound = %conflict.bound_account_id,
                "vault stays offline, bound to a different account"
            );
            self.enter_degraded(&vault, SyncStatus::Offline, Some(BOUND_ELSEWHERE));
            return Ok(());
        }

        let loaded = inner.index.load(&vault).await?;
        let created = inner.index.scan_and_create_ids(&vault).await?;
        debug!(vault = %vault.display(), loaded, created, "file index ready");

        let binding = match inner.binder.store().get(&vault).await? {
            Some(binding) => binding,
            None => match inner
                .binder
                .try_auto_binding(&client, &vault, &settings.device_id)
                .await
            {
                Ok(binding) => binding,
                Err(err) => {
                    warn!(vault = %vault.display(), err = %err, "auto binding failed");
                    inner
                        .binder
                        .schedule_retry(client, vault.clone(), settings.device_id.clone());
                    self.enter_degraded(&vault, SyncStatus::Offline, Some(AUTO_BINDING_FAILED));
                    return Ok(());
                }
            },
        };

        info!(vault = %vault.display(), vault_id = %binding.vault_id, "vault bound");
        inner.state.set_vault(&vault, Some(binding.vault_id));
        inner.state.set_status(SyncStatus::Idle);
        inner.state.set_error(None);
        inner.state.broadcast();

        tokio::spawn(sync_job(Arc::downgrade(&self.inner)));
        Ok(())
    }

    /// Back to a freshly constructed engine: timers cancelled, in-flight sync
    /// aborted, caches dropped, retries cancelled.
    pub fn stop(&self) {
        let inner = &self.inner;
        if let Some(vault) = inner.state.vault_path() {
            inner.scheduler.cancel_vault(&vault);
            inner.index.clear_cache(&vault);
            inner.detector.clear(&vault);
        }
        inner.scheduler.shutdown();
        inner.binder.cancel_retries();
        {
            let mut sync_lock = lock(&inner.sync_lock);
            if let Some(abort) = sync_lock.abort.take() {
                abort.abort();
            }
            sync_lock.release();
            sync_lock.generation += 1;
        }
        *lock(&inner.client) = None;
        lock(&inner.recent_writes).clear();
        inner.state.reset();
        inner.state.broadcast();
        debug!("engine stopped");
    }

    pub async fn reinit(&self) -> Result<(), EngineError> {
        let Some(vault) = self.inner.state.vault_path() else {
            return Ok(());
        };
        self.stop();
        self.init(&vault).await
    }

    pub async fn handle_file_change(&self, change: FileChange) {
        let inner = &self.inner;
        let Some(vault) = inner.state.vault_path() else {
            return;
        };
        if inner.state.status() == SyncStatus::Disabled {
            return;
        }

        match change {
            FileChange::Add(path) | FileChange::Change(path) => {
                if self.is_relevant(&path) {
                    self.mark_upload(&vault, &path);
                }
            }
            FileChange::Unlink(path) => {
                if !self.is_relevant(&path) {
                    return;
                }
                self.mark_delete(&vault, &path).await;
            }
            FileChange::Rename { from, to } => {
                let from = from.filter(|old| self.is_relevant(old));
                match (from, self.is_relevant(&to)) {
                    (None, false) => return,
                    (Some(old), false) => self.mark_delete(&vault, &old).await,
                    (None, true) => self.mark_upload(&vault, &to),
                    (Some(old), true) => {
                        match inner.index.move_path(&vault, &old, &to).await {
                            Ok(moved) => {
                                debug!(from = %old, to = %to, file_id = ?moved, "index mapping moved");
                            }
                            Err(err) => {
                                warn!(from = %old, to = %to, err = %err, "index move failed");
                            }
                        }
                        inner.detector.move_provisional(&vault, &old, &to);
                        inner.scheduler.cancel_vectorize(&vault, &old);
                        inner.state.remove_pending(&old);
                        self.mark_upload(&vault, &to);
                    }
                }
            }
        }
        inner.state.broadcast();
    }

    /// Runs a sync now, subject to the single-flight lock.
    pub async fn trigger_sync(&self) {
        self.perform_sync().await;
    }

    /// At most one attempt runs at a time. A lock held past `lock_timeout` is
    /// taken over: the stale attempt is aborted before the new one starts.
    pub async fn perform_sync(&self) {
        let inner = &self.inner;
        let (generation, registration, forced) = {
            let mut sync_lock = lock(&inner.sync_lock);
            let mut forced = false;
            if sync_lock.held {
                if !sync_lock.is_stale(inner.config.lock_timeout) {
                    debug!("sync already in flight");
                    return;
                }
                if let Some(abort) = sync_lock.abort.take() {
                    abort.abort();
                }
                forced = true;
            }
            let (abort, registration) = AbortHandle::new_pair();
            sync_lock.held = true;
            sync_lock.acquired_at = Some(Instant::now());
            sync_lock.generation += 1;
            sync_lock.abort = Some(abort);
            (sync_lock.generation, registration, forced)
        };
        let _release = LockRelease {
            lock: &inner.sync_lock,
            generation,
        };

        if forced {
            warn!(
                timeout_secs = inner.config.lock_timeout.as_secs(),
                "sync lock held past timeout, aborted stale attempt"
            );
            inner.state.activity().end_sync();
            if inner.state.status() == SyncStatus::Syncing {
                inner.state.set_status(SyncStatus::Idle);
            }
        }

        self.run_guarded(registration).await;
    }

    pub fn get_status(&self) -> SyncStatusSnapshot {
        self.inner.state.snapshot()
    }

    pub fn get_status_detail(&self) -> StatusDetail {
        self.inner.state.detail()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn on_status_change<F>(&self, listener: F) -> StatusSubscription
    where
        F: FnMut(SyncStatusSnapshot) + Send + 'static,
    {
        StatusSubscription::spawn(self.inner.state.subscribe(), listener)
    }

    async fn run_guarded(&self, registration: AbortRegistration) {
        if Abortable::new(self.perform_sync_internal(), registration)
            .await
            .is_err()
        {
            debug!("sync attempt aborted");
        }
    }

    async fn perform_sync_internal(&self) {
        let inner = &self.inner;
        let Some(vault) = inner.state.vault_path() else {
            return;
        };
        // Binding-level degraded modes never carry a remote id.
        let Some(vault_id) = inner.state.vault_id() else {
            return;
        };
        if matches!(
            inner.state.status(),
            SyncStatus::Syncing | SyncStatus::Disabled
        ) {
            return;
        }
        let settings = match inner.settings.load() {
            Ok(settings) => settings,
            Err(err) => {
                warn!(err = %err, "failed to read settings, skipping sync");
                return;
            }
        };
        if !settings.sync_enabled {
            return;
        }
        let Some(client) = lock(&inner.client).clone() else {
            return;
        };

        inner.state.begin_sync();
        inner.state.broadcast();

        if let Err(err) = self.run_sync(&client, &vault, &vault_id, &settings).await {
            let status = err.status_after_failure();
            warn!(vault = %vault.display(), err = %err, status = %status, "sync failed");
            inner.state.activity().end_sync();
            inner.state.set_status(status);
            inner.state.set_error(Some(err.to_string()));
            inner.state.broadcast();
        }
    }

    async fn run_sync(
        &self,
        client: &CloudSyncClient,
        vault: &Path,
        vault_id: &str,
        settings: &SyncSettings,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        let cutoff = OffsetDateTime::now_utc();
        let pending = inner.state.pending_changes();
        let detected = inner
            .detector
            .detect_local_changes(&inner.index, vault, &pending)
            .await?;
        let captured: Vec<String> = detected.pending_changes.keys().cloned().collect();
        let upload_count = detected.dtos.len();

        let diff = client
            .sync_diff(&SyncDiffRequest {
                vault_id: vault_id.to_string(),
                device_id: settings.device_id.clone(),
                local_files: detected.dtos,
            })
            .await?;

        if diff.actions.is_empty() && detected.pending_changes.is_empty() {
            debug!(vault = %vault.display(), "nothing to sync");
            self.finish_sync(vault, &captured, cutoff, &[]);
            return Ok(());
        }

        inner.state.activity().start_sync(diff.actions.len());
        inner.state.broadcast();

        let ctx = ExecutionContext {
            client,
            transfer: &inner.transfer,
            vault_path: vault,
            vault_id,
        };
        let result = execute_actions_with_tracking(
            &diff.actions,
            &ctx,
            &detected.pending_changes,
            |progress| {
                self.note_write(&progress);
                track_progress(&inner.state, progress);
            },
        )
        .await;
        self.remember_writes(&result);

        // Paths without a committed outcome stay pending for the next diff.
        let mut unsettled: HashSet<&str> = result
            .errors
            .iter()
            .map(|failure| failure.action.relative_path.as_str())
            .chain(result.skipped.iter().map(String::as_str))
            .collect();
        if result.has_committable() {
            let commit = client
                .sync_commit(&SyncCommitRequest {
                    vault_id: vault_id.to_string(),
                    device_id: settings.device_id.clone(),
                    completed: result.completed.clone(),
                    deleted: result.deleted.clone(),
                    vectorize_enabled: settings.vectorize_enabled,
                })
                .await?;
            let rejected: Vec<&str> = commit
                .conflicts
                .iter()
                .map(|conflict| conflict.file_id.as_str())
                .collect();
            if commit.success {
                self.apply_changes_to_file_index(vault, &result, &rejected)
                    .await?;
            } else {
                info!(
                    vault = %vault.display(),
                    conflicts = commit.conflicts.len(),
                    "commit reported conflicts, deferring to next diff"
                );
            }
            let uncommitted = result
                .completed
                .iter()
                .map(|file| (file.file_id.as_str(), file.relative_path.as_str()))
                .chain(
                    result
                        .deleted
                        .iter()
                        .map(|file| (file.file_id.as_str(), file.relative_path.as_str())),
                )
                .filter(|(file_id, _)| !commit.success || rejected.contains(file_id))
                .map(|(_, relative_path)| relative_path);
            unsettled.extend(uncommitted);
        }
        let settled: Vec<String> = captured
            .into_iter()
            .filter(|path| !unsettled.contains(path.as_str()))
            .collect();

        info!(
            vault = %vault.display(),
            local_changes = upload_count,
            actions = diff.actions.len(),
            completed = result.completed.len(),
            deleted = result.deleted.len(),
            failed = result.errors.len(),
            kept_pending = unsettled.len(),
            "sync finished"
        );
        self.finish_sync(vault, &settled, cutoff, &result.conflict_copies);
        Ok(())
    }

    /// Persists the committed subset. Items the server rejected stay out of
    /// the index and resurface in the next diff.
    async fn apply_changes_to_file_index(
        &self,
        vault: &Path,
        result: &ExecutionResult,
        rejected: &[&str],
    ) -> Result<(), EngineError> {
        let mut changes = Vec::with_capacity(result.completed.len() + result.deleted.len());
        let mut committed_paths = Vec::new();

        for file in &result.completed {
            if rejected.contains(&file.file_id.as_str()) {
                continue;
            }
            let modified = match vault_path_for(vault, &file.relative_path) {
                Ok(path) => tokio::fs::metadata(&path)
                    .await
                    .ok()
                    .and_then(|meta| modified_unix(&meta)),
                Err(_) => None,
            };
            changes.push(IndexChange::Upsert(IndexEntry {
                relative_path: file.relative_path.clone(),
                file_id: file.file_id.clone(),
                content_hash: file.content_hash.clone(),
                size: file.size.map(|size| size as i64),
                modified,
            }));
            committed_paths.push(file.relative_path.as_str());
        }
        for file in &result.deleted {
            if rejected.contains(&file.file_id.as_str()) {
                continue;
            }
            changes.push(IndexChange::Remove {
                relative_path: file.relative_path.clone(),
            });
            committed_paths.push(file.relative_path.as_str());
        }

        self.inner.index.apply_changes(vault, &changes).await?;
        self.inner
            .detector
            .forget_provisional(vault, committed_paths);
        Ok(())
    }

    /// Clears `settled` paths marked before `cutoff`. Fresh edits and conflict
    /// copies sync after the usual debounce; leftovers of failed actions wait
    /// for `RETRY_DELAY`.
    fn finish_sync(
        &self,
        vault: &Path,
        settled: &[String],
        cutoff: OffsetDateTime,
        conflict_copies: &[String],
    ) {
        let state = &self.inner.state;
        state.activity().end_sync();
        state.clear_pending(settled, cutoff);
        state.record_sync(OffsetDateTime::now_utc());
        state.set_status(SyncStatus::Idle);
        for copy in conflict_copies {
            state.add_pending(copy, ChangeType::Upload);
        }
        state.broadcast();

        if !conflict_copies.is_empty() || state.has_pending_since(cutoff) {
            self.schedule_sync(vault);
        } else if state.has_pending() {
            self.schedule_sync_after(vault, self.inner.config.sync_debounce.max(RETRY_DELAY));
        }
    }

    fn mark_upload(&self, vault: &Path, path: &str) {
        let inner = &self.inner;
        inner.state.add_pending(path, ChangeType::Upload);
        self.schedule_sync(vault);

        let weak = Arc::downgrade(&self.inner);
        let job_vault = vault.to_path_buf();
        let job_path = path.to_string();
        inner.scheduler.schedule_vectorize(
            vault,
            path,
            inner.config.vectorize_debounce,
            async move {
                if let Some(inner) = weak.upgrade() {
                    CloudSyncEngine { inner }
                        .vectorize(&job_vault, &job_path)
                        .await;
                }
            },
        );
    }

    async fn mark_delete(&self, vault: &Path, path: &str) {
        let inner = &self.inner;
        inner.state.add_pending(path, ChangeType::Delete);
        self.schedule_sync(vault);
        inner.scheduler.cancel_vectorize(vault, path);
        self.spawn_vector_delete(vault, path).await;
    }

    fn schedule_sync(&self, vault: &Path) {
        self.schedule_sync_after(vault, self.inner.config.sync_debounce);
    }

    fn schedule_sync_after(&self, vault: &Path, delay: Duration) {
        self.inner
            .scheduler
            .schedule_sync(vault, delay, sync_job(Arc::downgrade(&self.inner)));
    }

    async fn vectorize(&self, vault: &Path, path: &str) {
        let inner = &self.inner;
        let enabled = inner
            .settings
            .load()
            .map(|settings| settings.vectorize_enabled)
            .unwrap_or(false);
        if !enabled {
            return;
        }
        let (Some(vault_id), Some(client)) = (inner.state.vault_id(), lock(&inner.client).clone())
        else {
            return;
        };
        let file_id = match inner.index.file_id(vault, path).await {
            Ok(Some(file_id)) => file_id,
            Ok(None) => {
                debug!(path, "no committed id yet, vectorize left to commit");
                return;
            }
            Err(err) => {
                warn!(path, err = %err, "vectorize lookup failed");
                return;
            }
        };
        let request = VectorizeRequest {
            vault_id,
            file_id,
            relative_path: path.to_string(),
        };
        if let Err(err) = client.vectorize_file(&request).await {
            warn!(path, file_id = %request.file_id, err = %err, "vectorize failed");
        }
    }

    /// Resolves the id now, before the next sync can drop the mapping, and
    /// deletes the vector in the background.
    async fn spawn_vector_delete(&self, vault: &Path, path: &str) {
        let inner = &self.inner;
        let Some(client) = lock(&inner.client).clone() else {
            return;
        };
        let file_id = match inner.index.file_id(vault, path).await {
            Ok(Some(file_id)) => file_id,
            Ok(None) => return,
            Err(err) => {
                warn!(path, err = %err, "vector delete lookup failed");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = client.delete_vector(&file_id).await {
                warn!(file_id = %file_id, err = %err, "vector delete failed");
            }
        });
    }

    fn enter_degraded(&self, vault: &Path, status: SyncStatus, error: Option<&str>) {
        let state = &self.inner.state;
        state.set_vault(vault, None);
        state.set_status(status);
        state.set_error(error.map(str::to_string));
        state.broadcast();
    }

    fn is_relevant(&self, path: &str) -> bool {
        if path.is_empty() || is_ignored(path) {
            return false;
        }
        let mut recent = lock(&self.inner.recent_writes);
        recent.retain(|_, written| written.elapsed() < ECHO_WINDOW);
        if recent.contains_key(path) {
            debug!(path, "ignoring watcher echo of engine write");
            return false;
        }
        true
    }

    /// Marks a path the executor is about to write, so the watcher event it
    /// causes is not mistaken for a local edit.
    fn note_write(&self, progress: &ActionProgress<'_>) {
        let path = match &progress.outcome {
            ActionOutcome::Started if progress.action_type != SyncActionType::Upload => {
                progress.path
            }
            ActionOutcome::Preserving(copy) => copy.as_str(),
            _ => return,
        };
        lock(&self.inner.recent_writes).insert(path.to_string(), Instant::now());
    }

    /// Refreshes the echo window once the writes have landed.
    fn remember_writes(&self, result: &ExecutionResult) {
        let now = Instant::now();
        let mut recent = lock(&self.inner.recent_writes);
        let touched = result
            .completed
            .iter()
            .filter(|file| file.action != SyncActionType::Upload)
            .map(|file| &file.relative_path)
            .chain(result.deleted.iter().map(|file| &file.relative_path))
            .chain(result.conflict_copies.iter());
        for path in touched {
            recent.insert(path.clone(), now);
        }
    }
}

fn track_progress(state: &SyncState, progress: ActionProgress<'_>) {
    let activity = state.activity();
    let kind = match progress.action_type {
        SyncActionType::Upload => ActivityKind::Upload,
        SyncActionType::Download | SyncActionType::Conflict => ActivityKind::Download,
        SyncActionType::Delete => ActivityKind::Delete,
    };
    match progress.outcome {
        ActionOutcome::Started => activity.mark_active(progress.path, kind),
        ActionOutcome::Completed | ActionOutcome::Deleted | ActionOutcome::Skipped => {
            activity.mark_done(progress.path)
        }
        ActionOutcome::Failed(err) => activity.mark_error(progress.path, &err),
        ActionOutcome::Preserving(_) => return,
    }
    state.broadcast();
}

/// Boxed so debounce timers can hold a sync without naming its type.
fn sync_job(engine: Weak<EngineInner>) -> BoxFuture<'static, ()> {
    async move {
        if let Some(inner) = engine.upgrade() {
            CloudSyncEngine { inner }.perform_sync().await;
        }
    }
    .boxed()
}

async fn listen_for_binding_events(
    engine: Weak<EngineInner>,
    mut events: broadcast::Receiver<BindingEvent>,
) {
    loop {
        match events.recv().await {
            Ok(BindingEvent::Recovered { vault_path }) => {
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                let engine = CloudSyncEngine { inner };
                let current = engine.inner.state.vault_path();
                if current.as_deref() != Some(vault_path.as_path()) {
                    debug!(vault = %vault_path.display(), "binding recovered for inactive vault");
                    continue;
                }
                info!(vault = %vault_path.display(), "binding recovered, reinitialising");
                if let Err(err) = engine.reinit().await {
                    warn!(vault = %vault_path.display(), err = %err, "reinit after binding recovery failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "binding events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
