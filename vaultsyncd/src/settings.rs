use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::lock;

const SYNC_ENABLED_ENV: &str = "VAULTSYNC_SYNC_ENABLED";
const VECTORIZE_ENABLED_ENV: &str = "VAULTSYNC_VECTORIZE_ENABLED";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
    #[serde(default)]
    pub vectorize_enabled: bool,
    #[serde(default)]
    pub device_id: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            vectorize_enabled: false,
            device_id: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Read on every `init` and sync attempt, so edits apply without a restart.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> Result<SyncSettings, SettingsError>;
}

/// `settings.json` with environment overrides. A missing file or device id
/// is filled in with defaults and written back.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<Option<SyncSettings>, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_file(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl SettingsSource for FileSettings {
    fn load(&self) -> Result<SyncSettings, SettingsError> {
        let existing = self.read_file()?;
        let needs_write = existing
            .as_ref()
            .is_none_or(|settings| settings.device_id.trim().is_empty());
        let mut settings = existing.unwrap_or_default();
        if settings.device_id.trim().is_empty() {
            settings.device_id = uuid::Uuid::new_v4().to_string();
        }
        if needs_write {
            self.write_file(&settings)?;
        }

        apply_overrides(&mut settings, |name| env::var(name).ok());
        Ok(settings)
    }
}

fn apply_overrides<F>(settings: &mut SyncSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(SYNC_ENABLED_ENV).as_deref().and_then(parse_bool) {
        settings.sync_enabled = value;
    }
    if let Some(value) = lookup(VECTORIZE_ENABLED_ENV)
        .as_deref()
        .and_then(parse_bool)
    {
        settings.vectorize_enabled = value;
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// In-memory settings that can be flipped at runtime.
#[derive(Debug)]
pub struct StaticSettings {
    settings: Mutex<SyncSettings>,
}

impl StaticSettings {
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    pub fn enabled(device_id: &str) -> Self {
        Self::new(SyncSettings {
            device_id: device_id.to_string(),
            ..SyncSettings::default()
        })
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        lock(&self.settings).sync_enabled = enabled;
    }

    pub fn set_vectorize_enabled(&self, enabled: bool) {
        lock(&self.settings).vectorize_enabled = enabled;
    }
}

impl SettingsSource for StaticSettings {
    fn load(&self) -> Result<SyncSettings, SettingsError> {
        Ok(lock(&self.settings).clone())
    }
}
