use std::collections::HashMap;
use std::io;
use std::path::Path;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};
use vaultsync_core::{
    ApiError, ChangeType, CloudSyncClient, CompletedFile, DeletedFile, SyncAction,
    SyncActionType,
};

use super::conflict::{ConflictError, free_conflict_copy, move_within_vault};
use super::paths::{PathError, vault_path_for};
use super::state::PendingChange;
use super::transfer::{FileDigest, TransferClient, TransferError, file_digest};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("conflict copy failed: {0}")]
    Conflict(#[from] ConflictError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("local file missing: {0}")]
    MissingLocal(String),
}

pub struct ExecutionContext<'a> {
    pub client: &'a CloudSyncClient,
    pub transfer: &'a TransferClient,
    pub vault_path: &'a Path,
    pub vault_id: &'a str,
}

#[derive(Debug)]
pub struct ActionFailure {
    pub action: SyncAction,
    pub error: ActionError,
}

#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub completed: Vec<CompletedFile>,
    pub deleted: Vec<DeletedFile>,
    pub errors: Vec<ActionFailure>,
    /// Paths whose remote delete was held back by a local edit.
    pub skipped: Vec<String>,
    /// Local copies moved aside by conflicts; they are new untracked files.
    pub conflict_copies: Vec<String>,
}

impl ExecutionResult {
    pub fn has_committable(&self) -> bool {
        !self.completed.is_empty() || !self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Started,
    /// The local file is about to be moved to this conflict copy.
    Preserving(String),
    Completed,
    Deleted,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ActionProgress<'a> {
    pub index: usize,
    pub total: usize,
    pub path: &'a str,
    pub action_type: SyncActionType,
    pub outcome: ActionOutcome,
}

enum Applied {
    Completed(CompletedFile),
    Deleted(DeletedFile),
    Skipped,
}

/// Runs server-decided actions one by one. Failures are collected and the
/// loop keeps going; nothing here touches the file index.
pub async fn execute_actions_with_tracking<F>(
    actions: &[SyncAction],
    ctx: &ExecutionContext<'_>,
    pending: &HashMap<String, PendingChange>,
    mut on_progress: F,
) -> ExecutionResult
where
    F: FnMut(ActionProgress<'_>),
{
    let total = actions.len();
    let mut result = ExecutionResult::default();

    for (index, action) in actions.iter().enumerate() {
        let path = action.relative_path.as_str();
        let action_type = action.action_type;
        let progress = move |outcome| ActionProgress {
            index,
            total,
            path,
            action_type,
            outcome,
        };
        on_progress(progress(ActionOutcome::Started));

        let local_upload_pending = pending
            .get(&action.relative_path)
            .is_some_and(|change| change.change_type == ChangeType::Upload);

        let applied = {
            let mut announce = |outcome: ActionOutcome| on_progress(progress(outcome));
            execute_one(
                action,
                ctx,
                local_upload_pending,
                &mut result.conflict_copies,
                &mut announce,
            )
            .await
        };
        match applied {
            Ok(Applied::Completed(file)) => {
                debug!(path = %action.relative_path, action = ?action.action_type, "action completed");
                result.completed.push(file);
                on_progress(progress(ActionOutcome::Completed));
            }
            Ok(Applied::Deleted(file)) => {
                debug!(path = %action.relative_path, "local file deleted");
                result.deleted.push(file);
                on_progress(progress(ActionOutcome::Deleted));
            }
            Ok(Applied::Skipped) => {
                debug!(path = %action.relative_path, "remote delete skipped, local edit pending");
                result.skipped.push(action.relative_path.clone());
                on_progress(progress(ActionOutcome::Skipped));
            }
            Err(error) => {
                warn!(
                    path = %action.relative_path,
                    file_id = %action.file_id,
                    action = ?action.action_type,
                    err = %error,
                    "sync action failed"
                );
                on_progress(progress(ActionOutcome::Failed(error.to_string())));
                result.errors.push(ActionFailure {
                    action: action.clone(),
                    error,
                });
            }
        }
    }

    result
}

async fn execute_one<A>(
    action: &SyncAction,
    ctx: &ExecutionContext<'_>,
    local_upload_pending: bool,
    conflict_copies: &mut Vec<String>,
    announce: &mut A,
) -> Result<Applied, ActionError>
where
    A: FnMut(ActionOutcome),
{
    match action.action_type {
        SyncActionType::Upload => upload(action, ctx).await.map(Applied::Completed),
        SyncActionType::Download if !local_upload_pending => {
            download(action, ctx).await.map(Applied::Completed)
        }
        SyncActionType::Download | SyncActionType::Conflict => {
            let (file, copy) = download_over_local(action, ctx, announce).await?;
            conflict_copies.extend(copy);
            Ok(Applied::Completed(file))
        }
        SyncActionType::Delete if local_upload_pending => Ok(Applied::Skipped),
        SyncActionType::Delete => delete_local(action, ctx).await.map(Applied::Deleted),
    }
}

async fn upload(
    action: &SyncAction,
    ctx: &ExecutionContext<'_>,
) -> Result<CompletedFile, ActionError> {
    let source = vault_path_for(ctx.vault_path, &action.relative_path)?;
    let digest = match file_digest(&source).await {
        Ok(digest) => digest,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ActionError::MissingLocal(action.relative_path.clone()));
        }
        Err(err) => return Err(err.into()),
    };
    let link = ctx
        .client
        .get_upload_link(ctx.vault_id, &action.file_id, &action.relative_path)
        .await?;
    ctx.transfer
        .upload_from_path(link.href.as_str(), &source)
        .await?;
    Ok(CompletedFile {
        file_id: action.file_id.clone(),
        relative_path: action.relative_path.clone(),
        action: SyncActionType::Upload,
        content_hash: Some(digest.content_hash),
        size: Some(digest.size),
    })
}

async fn download(
    action: &SyncAction,
    ctx: &ExecutionContext<'_>,
) -> Result<CompletedFile, ActionError> {
    let target = vault_path_for(ctx.vault_path, &action.relative_path)?;
    let link = ctx
        .client
        .get_download_link(ctx.vault_id, &action.file_id)
        .await?;
    let digest = ctx
        .transfer
        .download_to_path(link.href.as_str(), &target, action.content_hash.as_deref())
        .await?;
    Ok(completed_download(action, SyncActionType::Download, digest))
}

/// Remote wins the original path. The remote body is verified in its
/// `.partial` before the local file moves aside, and the local file is moved
/// back if the partial cannot be installed.
async fn download_over_local<A>(
    action: &SyncAction,
    ctx: &ExecutionContext<'_>,
    announce: &mut A,
) -> Result<(CompletedFile, Option<String>), ActionError>
where
    A: FnMut(ActionOutcome),
{
    let target = vault_path_for(ctx.vault_path, &action.relative_path)?;
    let link = ctx
        .client
        .get_download_link(ctx.vault_id, &action.file_id)
        .await?;
    let staged = ctx
        .transfer
        .stage_download(link.href.as_str(), &target, action.content_hash.as_deref())
        .await?;

    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    let copy = match free_conflict_copy(ctx.vault_path, &action.relative_path, stamp).await {
        Ok(copy) => copy,
        Err(err) => {
            staged.discard().await;
            return Err(err.into());
        }
    };
    if let Some(copy) = &copy {
        announce(ActionOutcome::Preserving(copy.clone()));
        if let Err(err) = move_within_vault(ctx.vault_path, &action.relative_path, copy).await {
            staged.discard().await;
            return Err(err.into());
        }
    }

    match staged.install(&target).await {
        Ok(digest) => Ok((
            completed_download(action, SyncActionType::Conflict, digest),
            copy,
        )),
        Err(err) => {
            if let Some(copy) = &copy
                && let Err(restore) =
                    move_within_vault(ctx.vault_path, copy, &action.relative_path).await
            {
                warn!(
                    path = %action.relative_path,
                    copy = %copy,
                    err = %restore,
                    "failed to move local copy back"
                );
            }
            Err(err.into())
        }
    }
}

fn completed_download(
    action: &SyncAction,
    reported_as: SyncActionType,
    digest: FileDigest,
) -> CompletedFile {
    CompletedFile {
        file_id: action.file_id.clone(),
        relative_path: action.relative_path.clone(),
        action: reported_as,
        content_hash: Some(digest.content_hash),
        size: Some(digest.size),
    }
}

async fn delete_local(
    action: &SyncAction,
    ctx: &ExecutionContext<'_>,
) -> Result<DeletedFile, ActionError> {
    let target = vault_path_for(ctx.vault_path, &action.relative_path)?;
    match tokio::fs::remove_file(&target).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(DeletedFile {
        file_id: action.file_id.clone(),
        relative_path: action.relative_path.clone(),
    })
}
