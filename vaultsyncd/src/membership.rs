use std::env;

use tracing::warn;

use crate::storage::StorageError;
use crate::storage::membership_store::{MembershipStore, StoredMembership};

const TOKEN_ENV: &str = "VAULTSYNC_TOKEN";
const ACCOUNT_ENV: &str = "VAULTSYNC_ACCOUNT_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    pub token: String,
    pub account_id: String,
}

impl From<StoredMembership> for MembershipConfig {
    fn from(stored: StoredMembership) -> Self {
        Self {
            token: stored.token,
            account_id: stored.account_id,
        }
    }
}

/// Where the engine gets its session from. `None` means signed out.
pub trait MembershipSource: Send + Sync {
    fn config(&self) -> Option<MembershipConfig>;
}

/// Environment first, then the OS keyring.
#[derive(Debug, Default)]
pub struct SystemMembership;

impl SystemMembership {
    pub fn new() -> Self {
        Self
    }

    pub fn logout(&self) -> Result<(), StorageError> {
        MembershipStore::new()?.delete()
    }
}

impl MembershipSource for SystemMembership {
    fn config(&self) -> Option<MembershipConfig> {
        if let Some(config) = config_from_lookup(|name| env::var(name).ok()) {
            return Some(config);
        }
        let loaded = MembershipStore::new().and_then(|store| store.load());
        match loaded {
            Ok(stored) => Some(stored.into()),
            Err(StorageError::MembershipNotFound) => None,
            Err(err) => {
                warn!(err = %err, "failed to read membership from keyring");
                None
            }
        }
    }
}

/// Fixed membership, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership(pub Option<MembershipConfig>);

impl StaticMembership {
    pub fn signed_in(token: &str, account_id: &str) -> Self {
        Self(Some(MembershipConfig {
            token: token.to_string(),
            account_id: account_id.to_string(),
        }))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl MembershipSource for StaticMembership {
    fn config(&self) -> Option<MembershipConfig> {
        self.0.clone()
    }
}

fn config_from_lookup<F>(lookup: F) -> Option<MembershipConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let token = lookup(TOKEN_ENV).filter(|value| !value.trim().is_empty())?;
    let account_id = lookup(ACCOUNT_ENV).filter(|value| !value.trim().is_empty())?;
    Some(MembershipConfig { token, account_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn env_membership_needs_token_and_account() {
        assert!(config_from_lookup(lookup_from(&[(TOKEN_ENV, "t")])).is_none());
        assert!(config_from_lookup(lookup_from(&[(TOKEN_ENV, " "), (ACCOUNT_ENV, "a")])).is_none());

        let config =
            config_from_lookup(lookup_from(&[(TOKEN_ENV, "t"), (ACCOUNT_ENV, "a")])).unwrap();
        assert_eq!(config.token, "t");
        assert_eq!(config.account_id, "a");
    }

    #[test]
    fn static_membership_reports_state() {
        assert!(StaticMembership::signed_out().config().is_none());
        assert_eq!(
            StaticMembership::signed_in("t", "a").config().unwrap().account_id,
            "a"
        );
    }
}
