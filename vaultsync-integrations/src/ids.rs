pub const APP_ID_BASE: &str = "app.vaultsync";
pub const APP_DIR_NAME: &str = "vaultsync";

pub const KEYRING_SERVICE: &str = APP_ID_BASE;
pub const KEYRING_MEMBERSHIP_KEY: &str = "membership";

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const INDEX_DB_FILE_NAME: &str = "index.db";
