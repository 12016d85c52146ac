mod client;

pub use client::{
    ApiError, ApiErrorClass, BindVaultRequest, ChangeType, CloudSyncClient, CommitConflict,
    CompletedFile, DeletedFile, LocalFileChange, RemoteVault, SyncAction, SyncActionType,
    SyncCommitRequest, SyncCommitResponse, SyncDiffRequest, SyncDiffResponse, TransferLink,
    VectorizeRequest,
};
