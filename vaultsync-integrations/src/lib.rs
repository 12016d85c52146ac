pub mod ids;

use std::path::PathBuf;

use anyhow::Context;

use crate::ids::{APP_DIR_NAME, INDEX_DB_FILE_NAME, SETTINGS_FILE_NAME};

pub fn app_config_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::config_dir().context("XDG config directory is unavailable")?;
    Ok(base.join(APP_DIR_NAME))
}

pub fn app_data_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir().context("XDG data directory is unavailable")?;
    Ok(base.join(APP_DIR_NAME))
}

pub fn default_settings_path() -> anyhow::Result<PathBuf> {
    Ok(app_config_dir()?.join(SETTINGS_FILE_NAME))
}

pub fn default_index_db_path() -> anyhow::Result<PathBuf> {
    Ok(app_data_dir()?.join(INDEX_DB_FILE_NAME))
}
