use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// A regular file found under the vault root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub relative_path: String,
    pub size: u64,
    pub modified: Option<i64>,
}

pub fn vault_path_for(vault_root: &Path, relative_path: &str) -> Result<PathBuf, PathError> {
    if relative_path.trim_matches('/').is_empty() {
        return Err(PathError::Empty);
    }

    // Relative paths are POSIX-like ("notes/a.md"); map them under the vault root.
    let mut out = vault_root.to_path_buf();
    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn relative_path_of(vault_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(vault_root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Dot-prefixed components (`.git`, `.trash`, editor state) never sync.
pub fn is_ignored(relative_path: &str) -> bool {
    relative_path
        .split('/')
        .any(|part| part.starts_with('.') || part.ends_with(".partial"))
}

/// Blocking recursive listing of syncable files under `vault_root`.
/// Entries that disappear mid-walk are skipped.
pub fn list_vault_files(vault_root: &Path) -> io::Result<Vec<LocalFile>> {
    if !vault_root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("vault root is not a directory: {}", vault_root.display()),
        ));
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(vault_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative_path) = relative_path_of(vault_root, entry.path()) else {
            continue;
        };
        if is_ignored(&relative_path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        files.push(LocalFile {
            relative_path,
            size: meta.len(),
            modified: modified_unix(&meta),
        });
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

pub fn modified_unix(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}
