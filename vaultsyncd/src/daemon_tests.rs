use super::*;
use crate::membership::StaticMembership;
use crate::settings::StaticSettings;
use tempfile::tempdir;

fn test_config(root: &Path) -> DaemonConfig {
    DaemonConfig {
        vault_dir: root.join("vault"),
        api_url: "http://127.0.0.1:9".into(),
        sync_debounce: Duration::from_millis(10),
        vectorize_debounce: Duration::from_millis(10),
        lock_timeout: Duration::from_secs(5),
        enable_local_watcher: false,
        binding_resolution: None,
        db_path: root.join("data/index.db"),
        settings_path: root.join("config/settings.json"),
    }
}

fn conflict() -> BindingConflict {
    BindingConflict {
        vault_path: PathBuf::from("/vault"),
        vault_id: "v1".into(),
        bound_account_id: "acct-old".into(),
        current_account_id: "acct-new".into(),
    }
}

#[test]
fn expands_tilde_to_home_vault_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Vault", &home),
        PathBuf::from("/tmp/home-user/Vault")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/vault", &home), PathBuf::from("/srv/vault"));
}

#[test]
fn reads_numbers_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
}

#[test]
fn local_watcher_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
}

#[test]
fn missing_resolution_env_is_none() {
    assert_eq!(read_resolution_env("NO_SUCH_RESOLUTION_ENV_FOR_TEST"), None);
}

#[test]
fn parses_terminal_answers() {
    assert_eq!(
        parse_resolution_answer("1\n"),
        Some(BindingResolution::StayOffline)
    );
    assert_eq!(
        parse_resolution_answer(" 2 "),
        Some(BindingResolution::SyncToCurrent)
    );
    assert_eq!(
        parse_resolution_answer("sync_to_current"),
        Some(BindingResolution::SyncToCurrent)
    );
    assert_eq!(parse_resolution_answer("maybe"), None);
}

#[test]
fn question_names_both_accounts() {
    let question = conflict_question(&conflict());
    assert!(question.contains("acct-old"));
    assert!(question.contains("acct-new"));
}

#[tokio::test]
async fn configured_resolution_skips_terminal() {
    let prompt = TerminalPrompt::new(Some(BindingResolution::SyncToCurrent));
    assert_eq!(
        prompt.resolve(&conflict()).await,
        BindingResolution::SyncToCurrent
    );
}

#[test]
fn engine_config_mirrors_daemon_config() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let engine = config.engine_config();
    assert_eq!(engine.api_base_url, config.api_url);
    assert_eq!(engine.sync_debounce, Duration::from_millis(10));
    assert_eq!(engine.lock_timeout, Duration::from_secs(5));
}

#[tokio::test]
async fn built_engine_without_membership_is_disabled() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.vault_dir).unwrap();

    let engine = build_engine(
        &config,
        Arc::new(StaticMembership::signed_out()),
        Arc::new(StaticSettings::enabled("d1")),
    )
    .await
    .unwrap();
    engine.init(&config.vault_dir).await.unwrap();

    assert!(config.db_path.exists());
    let status = engine.get_status();
    assert_eq!(status.status, SyncStatus::Disabled);
    assert_eq!(status.vault_path.as_deref(), Some(config.vault_dir.as_path()));
}

#[test]
fn status_logger_tolerates_repeated_snapshots() {
    let mut log = status_logger();
    let snapshot = SyncStatusSnapshot {
        status: SyncStatus::Offline,
        error: Some("network down".into()),
        ..SyncStatusSnapshot::default()
    };
    log(snapshot.clone());
    log(snapshot);
    log(SyncStatusSnapshot::default());
}
