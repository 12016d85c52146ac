use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// Content fingerprint of a file that was just written or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub content_hash: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("VAULTSYNC_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("VAULTSYNC_UPLOAD_CONCURRENCY", 2),
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `href` into `target` through a `.partial` sibling, verifying the
    /// SHA-256 when the server supplied one. The target is only replaced once
    /// the whole body has been written and checked.
    pub async fn download_to_path(
        &self,
        href: &str,
        target: &Path,
        expected_hash: Option<&str>,
    ) -> Result<FileDigest, TransferError> {
        let staged = self.stage_download(href, target, expected_hash).await?;
        staged.install(target).await
    }

    /// Downloads and verifies into the `.partial` sibling of `target` without
    /// touching `target` itself. A failed or mismatched body leaves no partial
    /// file behind.
    pub async fn stage_download(
        &self,
        href: &str,
        target: &Path,
        expected_hash: Option<&str>,
    ) -> Result<StagedDownload, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        match write_partial(response, &partial, expected_hash).await {
            Ok(digest) => Ok(StagedDownload { partial, digest }),
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    pub async fn upload_from_path(&self, href: &str, source: &Path) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        self.http
            .put(url)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A verified download waiting in its `.partial` file.
#[derive(Debug)]
pub struct StagedDownload {
    partial: PathBuf,
    digest: FileDigest,
}

impl StagedDownload {
    pub fn digest(&self) -> &FileDigest {
        &self.digest
    }

    /// Renames the partial over `target`.
    pub async fn install(self, target: &Path) -> Result<FileDigest, TransferError> {
        if let Err(err) = tokio::fs::rename(&self.partial, target).await {
            let _ = tokio::fs::remove_file(&self.partial).await;
            return Err(err.into());
        }
        Ok(self.digest)
    }

    pub async fn discard(self) {
        let _ = tokio::fs::remove_file(&self.partial).await;
    }
}

async fn write_partial(
    response: reqwest::Response,
    partial: &Path,
    expected_hash: Option<&str>,
) -> Result<FileDigest, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    let actual = hex_digest(hasher);
    if let Some(expected) = expected_hash {
        let expected = expected.to_ascii_lowercase();
        if actual != expected {
            return Err(TransferError::IntegrityMismatch { expected, actual });
        }
    }
    Ok(FileDigest {
        content_hash: actual,
        size,
    })
}

pub async fn file_digest(path: &Path) -> io::Result<FileDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok(FileDigest {
        content_hash: hex_digest(hasher),
        size,
    })
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub(crate) fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
