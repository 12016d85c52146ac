use keyring::Entry;
use serde::{Deserialize, Serialize};
use vaultsync_integrations::ids::{KEYRING_MEMBERSHIP_KEY, KEYRING_SERVICE};

use super::StorageError;

/// Account credentials as persisted in the OS keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMembership {
    pub token: String,
    pub account_id: String,
}

pub struct MembershipStore {
    entry: Entry,
}

impl MembershipStore {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            entry: Entry::new(KEYRING_SERVICE, KEYRING_MEMBERSHIP_KEY)?,
        })
    }

    pub fn save(&self, membership: &StoredMembership) -> Result<(), StorageError> {
        let payload = serde_json::to_string(membership)?;
        self.entry.set_password(&payload)?;
        Ok(())
    }

    pub fn load(&self) -> Result<StoredMembership, StorageError> {
        match self.entry.get_password() {
            Ok(payload) => Ok(serde_json::from_str(&payload)?),
            Err(keyring::Error::NoEntry) => Err(StorageError::MembershipNotFound),
            Err(err) => Err(StorageError::Keyring(err)),
        }
    }

    pub fn delete(&self) -> Result<(), StorageError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StorageError::Keyring(err)),
        }
    }
}
