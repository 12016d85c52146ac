async fn build_engine(
    config: &DaemonConfig,
    membership: Arc<dyn MembershipSource>,
    settings: Arc<dyn SettingsSource>,
) -> anyhow::Result<CloudSyncEngine> {
    let index = FileIndex::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open index database at {:?}", config.db_path))?;
    let bindings = BindingStore::from_pool(index.pool());
    bindings
        .init()
        .await
        .context("failed to initialise binding store")?;

    let mut deps = EngineDeps::new(index, bindings, membership, settings);
    deps.prompt = Arc::new(TerminalPrompt::new(config.binding_resolution));
    Ok(CloudSyncEngine::new(config.engine_config(), deps))
}

/// Logs status transitions, not every snapshot.
fn status_logger() -> impl FnMut(SyncStatusSnapshot) + Send + 'static {
    let mut last: Option<(SyncStatus, Option<String>)> = None;
    move |snapshot| {
        let current = (snapshot.status, snapshot.error.clone());
        if last.as_ref() == Some(&current) {
            return;
        }
        match &snapshot.error {
            Some(error) => warn!(status = %snapshot.status, error = %error, "sync status"),
            None => info!(
                status = %snapshot.status,
                pending = snapshot.pending_paths.len(),
                "sync status"
            ),
        }
        last = Some(current);
    }
}

fn conflict_question(conflict: &BindingConflict) -> String {
    format!(
        "The vault at {} is bound to account {} but you are signed in as {}.\n\
         [1] stay offline  [2] sync to the current account\n> ",
        conflict.vault_path.display(),
        conflict.bound_account_id,
        conflict.current_account_id,
    )
}

fn parse_resolution_answer(answer: &str) -> Option<BindingResolution> {
    match answer.trim() {
        "1" => Some(BindingResolution::StayOffline),
        "2" => Some(BindingResolution::SyncToCurrent),
        other => other.parse().ok(),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn read_resolution_env(name: &str) -> Option<BindingResolution> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(resolution) => Some(resolution),
        Err(_) => {
            warn!(name, value = %value, "ignoring unknown binding resolution");
            None
        }
    }
}
