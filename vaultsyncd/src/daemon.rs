use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use vaultsync_integrations::{default_index_db_path, default_settings_path};

use crate::membership::{MembershipSource, SystemMembership};
use crate::settings::{FileSettings, SettingsSource, parse_bool};
use crate::storage::binding_store::BindingStore;
use crate::sync::binding::{BindingConflict, BindingPrompt, BindingResolution};
use crate::sync::engine::{CloudSyncEngine, EngineConfig, EngineDeps};
use crate::sync::index::FileIndex;
use crate::sync::local_watcher::start_vault_watcher;
use crate::sync::state::{SyncStatus, SyncStatusSnapshot};

const DEFAULT_VAULT_DIR_NAME: &str = "Vault";
const DEFAULT_SYNC_DEBOUNCE_MS: u64 = 2000;
const DEFAULT_VECTORIZE_DEBOUNCE_MS: u64 = 5000;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub vault_dir: PathBuf,
    pub api_url: String,
    pub sync_debounce: Duration,
    pub vectorize_debounce: Duration,
    pub lock_timeout: Duration,
    pub enable_local_watcher: bool,
    pub binding_resolution: Option<BindingResolution>,
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let vault_dir = std::env::var("VAULTSYNC_VAULT_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_VAULT_DIR_NAME));
        let api_url = std::env::var("VAULTSYNC_API_URL")
            .unwrap_or_else(|_| EngineConfig::default().api_base_url);
        let sync_debounce = Duration::from_millis(read_u64_env(
            "VAULTSYNC_SYNC_DEBOUNCE_MS",
            DEFAULT_SYNC_DEBOUNCE_MS,
        ));
        let vectorize_debounce = Duration::from_millis(read_u64_env(
            "VAULTSYNC_VECTORIZE_DEBOUNCE_MS",
            DEFAULT_VECTORIZE_DEBOUNCE_MS,
        ));
        let lock_timeout = Duration::from_secs(read_u64_env(
            "VAULTSYNC_LOCK_TIMEOUT_SECS",
            DEFAULT_LOCK_TIMEOUT_SECS,
        ));
        let enable_local_watcher = read_bool_env("VAULTSYNC_ENABLE_LOCAL_WATCHER", true);
        let binding_resolution = read_resolution_env("VAULTSYNC_BINDING_RESOLUTION");
        let db_path = match std::env::var("VAULTSYNC_DB_PATH") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_index_db_path()?,
        };
        let settings_path = default_settings_path()?;

        Ok(Self {
            vault_dir,
            api_url,
            sync_debounce,
            vectorize_debounce,
            lock_timeout,
            enable_local_watcher,
            binding_resolution,
            db_path,
            settings_path,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            api_base_url: self.api_url.clone(),
            sync_debounce: self.sync_debounce,
            vectorize_debounce: self.vectorize_debounce,
            lock_timeout: self.lock_timeout,
        }
    }
}

/// Resolves binding conflicts from configuration, or by asking on the
/// controlling terminal.
pub struct TerminalPrompt {
    configured: Option<BindingResolution>,
}

impl TerminalPrompt {
    pub fn new(configured: Option<BindingResolution>) -> Self {
        Self { configured }
    }

    async fn ask(&self, conflict: &BindingConflict) -> std::io::Result<BindingResolution> {
        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(conflict_question(conflict).as_bytes())
            .await?;
        stderr.flush().await?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
        Ok(parse_resolution_answer(&line).unwrap_or(BindingResolution::StayOffline))
    }
}

#[async_trait]
impl BindingPrompt for TerminalPrompt {
    async fn resolve(&self, conflict: &BindingConflict) -> BindingResolution {
        if let Some(resolution) = self.configured {
            return resolution;
        }
        if !std::io::stdin().is_terminal() {
            warn!(
                vault = %conflict.vault_path.display(),
                "vault is bound to another account; set VAULTSYNC_BINDING_RESOLUTION to choose, staying offline"
            );
            return BindingResolution::StayOffline;
        }
        match self.ask(conflict).await {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(err = %err, "failed to read binding decision, staying offline");
                BindingResolution::StayOffline
            }
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: CloudSyncEngine,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.vault_dir)
            .await
            .with_context(|| format!("failed to create vault dir at {:?}", config.vault_dir))?;
        let mut config = config;
        config.vault_dir = tokio::fs::canonicalize(&config.vault_dir)
            .await
            .with_context(|| format!("failed to resolve vault dir {:?}", config.vault_dir))?;

        let engine = build_engine(
            &config,
            Arc::new(SystemMembership::new()),
            Arc::new(FileSettings::new(&config.settings_path)),
        )
        .await?;
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &CloudSyncEngine {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let vault = self.config.vault_dir.clone();
        info!(
            vault = %vault.display(),
            api = %self.config.api_url,
            local_watcher = self.config.enable_local_watcher,
            "vaultsyncd started"
        );

        let _status_log = self.engine.on_status_change(status_logger());
        self.engine
            .init(&vault)
            .await
            .context("failed to initialise sync engine")?;

        let mut watcher = None;
        let local_handle = if self.config.enable_local_watcher {
            match start_vault_watcher(&vault) {
                Ok((handle, mut rx)) => {
                    watcher = Some(handle);
                    let engine = self.engine.clone();
                    Some(tokio::spawn(async move {
                        while let Some(change) = rx.recv().await {
                            debug!(change = ?change, "local change");
                            engine.handle_file_change(change).await;
                        }
                    }))
                }
                Err(err) => {
                    warn!(err = %err, "failed to start local watcher");
                    None
                }
            }
        } else {
            None
        };

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        drop(watcher);
        if let Some(handle) = local_handle {
            handle.abort();
        }
        self.engine.stop();
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
