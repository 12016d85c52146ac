use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use super::engine::FileChange;
use super::paths::{is_ignored, relative_path_of};

/// Watches `root` recursively and forwards vault-relative changes. Dropping
/// the returned watcher stops delivery.
pub fn start_vault_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<FileChange>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in map_event(&watch_root, event) {
                let _ = tx.send(change);
            }
        }
        Err(err) => warn!(err = %err, "watcher error"),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<FileChange> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => map_rename(root, mode, &event.paths),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            Vec::new()
        }
        EventKind::Create(_) => files(root, &event.paths)
            .map(FileChange::Add)
            .collect(),
        EventKind::Modify(_) => files(root, &event.paths)
            .map(FileChange::Change)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| syncable(root, path))
            .map(FileChange::Unlink)
            .collect(),
        _ => Vec::new(),
    }
}

fn map_rename(root: &Path, mode: RenameMode, paths: &[PathBuf]) -> Vec<FileChange> {
    match (mode, paths) {
        (RenameMode::Both, [from, to, ..]) => {
            let from = syncable(root, from);
            match syncable(root, to).filter(|_| !to.is_dir()) {
                Some(to) => vec![FileChange::Rename { from, to }],
                None => from.map(FileChange::Unlink).into_iter().collect(),
            }
        }
        (RenameMode::From, [from, ..]) => syncable(root, from)
            .map(FileChange::Unlink)
            .into_iter()
            .collect(),
        (_, [to, ..]) if to.exists() => files(root, std::slice::from_ref(to))
            .map(|to| FileChange::Rename { from: None, to })
            .collect(),
        (_, [gone, ..]) => syncable(root, gone)
            .map(FileChange::Unlink)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn files<'a>(
    root: &'a Path,
    paths: &'a [PathBuf],
) -> impl Iterator<Item = String> + 'a {
    paths
        .iter()
        .filter(|path| !path.is_dir())
        .filter_map(move |path| syncable(root, path))
}

fn syncable(root: &Path, path: &Path) -> Option<String> {
    relative_path_of(root, path).filter(|relative| !is_ignored(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn maps_modify_event_to_change() {
        let root = Path::new("/tmp/vault");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any)),
                &["/tmp/vault/Docs/A.md"],
            ),
        );
        assert_eq!(mapped, vec![FileChange::Change("Docs/A.md".into())]);
    }

    #[test]
    fn maps_rename_event_to_rename() {
        let root = Path::new("/tmp/vault");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/vault/Docs/A.md", "/tmp/vault/Docs/B.md"],
            ),
        );
        assert_eq!(
            mapped,
            vec![FileChange::Rename {
                from: Some("Docs/A.md".into()),
                to: "Docs/B.md".into()
            }]
        );
    }

    #[test]
    fn rename_into_hidden_path_is_a_delete() {
        let root = Path::new("/tmp/vault");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/tmp/vault/A.md", "/tmp/vault/.trash/A.md"],
            ),
        );
        assert_eq!(mapped, vec![FileChange::Unlink("A.md".into())]);
    }

    #[test]
    fn ignored_and_outside_paths_are_dropped() {
        let root = Path::new("/tmp/vault");
        let mapped = map_event(
            root,
            event(
                EventKind::Create(CreateKind::File),
                &["/tmp/vault/.obsidian/app.json", "/elsewhere/x.md", "/tmp/vault"],
            ),
        );
        assert!(mapped.is_empty());
    }

    #[test]
    fn half_rename_from_is_unlink() {
        let root = Path::new("/tmp/vault");
        let mapped = map_event(
            root,
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/tmp/vault/a.md"],
            ),
        );
        assert_eq!(mapped, vec![FileChange::Unlink("a.md".into())]);
    }

    #[tokio::test]
    async fn watcher_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (_watcher, mut rx) = start_vault_watcher(&root).unwrap();

        std::fs::write(root.join("note.md"), b"x").unwrap();

        let change = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            change,
            FileChange::Add(ref path) | FileChange::Change(ref path) if path == "note.md"
        ));
    }
}
