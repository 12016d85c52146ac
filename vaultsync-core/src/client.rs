use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.vaultsync.app";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct CloudSyncClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl CloudSyncClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Sends the local change manifest and returns the server-ordered actions.
    pub async fn sync_diff(&self, request: &SyncDiffRequest) -> Result<SyncDiffResponse, ApiError> {
        let url = self.endpoint("/v1/sync/diff")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Makes locally executed results authoritative. A `success: false`
    /// response with conflicts is a normal outcome, not an error.
    pub async fn sync_commit(
        &self,
        request: &SyncCommitRequest,
    ) -> Result<SyncCommitResponse, ApiError> {
        let url = self.endpoint("/v1/sync/commit")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_vector(&self, file_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/v1/vectors/{file_id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_empty(response).await
    }

    pub async fn vectorize_file(&self, request: &VectorizeRequest) -> Result<(), ApiError> {
        let url = self.endpoint("/v1/vectors")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        Self::expect_empty(response).await
    }

    pub async fn bind_vault(&self, request: &BindVaultRequest) -> Result<RemoteVault, ApiError> {
        let url = self.endpoint("/v1/vaults/bind")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_download_link(
        &self,
        vault_id: &str,
        file_id: &str,
    ) -> Result<TransferLink, ApiError> {
        let url = self.endpoint(&format!("/v1/vaults/{vault_id}/files/{file_id}/download"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_upload_link(
        &self,
        vault_id: &str,
        file_id: &str,
        relative_path: &str,
    ) -> Result<TransferLink, ApiError> {
        let mut url = self.endpoint(&format!("/v1/vaults/{vault_id}/files/{file_id}/upload"))?;
        url.query_pairs_mut().append_pair("path", relative_path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            let body = response.bytes().await?;
            Ok(serde_json::from_slice(&body)?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }

    async fn expect_empty(response: reqwest::Response) -> Result<(), ApiError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.is_network_error()
            || matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, ApiError::Api { status, .. } if status.is_server_error())
    }

    /// Transport-level failures where the server never produced a status,
    /// including a connection dropped while the body was being read.
    pub fn is_network_error(&self) -> bool {
        match self {
            ApiError::Request(err) => {
                err.status().is_none()
                    && (err.is_connect()
                        || err.is_timeout()
                        || err.is_request()
                        || err.is_body()
                        || err.is_decode())
            }
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Upload,
    Delete,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileChange {
    pub file_id: String,
    pub relative_path: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiffRequest {
    pub vault_id: String,
    pub device_id: String,
    pub local_files: Vec<LocalFileChange>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncActionType {
    Upload,
    Download,
    Delete,
    Conflict,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    #[serde(rename = "type")]
    pub action_type: SyncActionType,
    pub file_id: String,
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncDiffResponse {
    #[serde(default)]
    pub actions: Vec<SyncAction>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedFile {
    pub file_id: String,
    pub relative_path: String,
    pub action: SyncActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedFile {
    pub file_id: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommitRequest {
    pub vault_id: String,
    pub device_id: String,
    pub completed: Vec<CompletedFile>,
    pub deleted: Vec<DeletedFile>,
    pub vectorize_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitConflict {
    pub file_id: String,
    pub relative_path: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommitResponse {
    pub success: bool,
    #[serde(default)]
    pub conflicts: Vec<CommitConflict>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorizeRequest {
    pub vault_id: String,
    pub file_id: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindVaultRequest {
    pub vault_name: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVault {
    pub id: String,
    pub name: String,
    pub account_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
}
