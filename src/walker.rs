#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("root '{0}' does not exist")]
    Missing(std::path::PathBuf),
    #[error("root '{0}' is not a directory")]
    NotADirectory(std::path::PathBuf),
    #[error("root '{0}' is a symlink")]
    Symlink(std::path::PathBuf),
    #[error("root '{path}' is unreadable: {source}")]
    Unreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One configured tree, addressed by `key` in URLs and index rows.
#[derive(Debug, Clone)]
pub struct MovieRoot {
    pub key: String,
    pub path: std::path::PathBuf,
}

impl MovieRoot {
    /// Validates `path` and canonicalizes it. Rejects missing paths, files and symlinks.
    pub fn open(key: &str, path: &std::path::Path) -> Result<Self, WalkError> {
        let metadata = std::fs::symlink_metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WalkError::Missing(path.to_path_buf())
            } else {
                WalkError::Unreadable {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        if metadata.file_type().is_symlink() {
            return Err(WalkError::Symlink(path.to_path_buf()));
        }
        if !metadata.is_dir() {
            return Err(WalkError::NotADirectory(path.to_path_buf()));
        }

        let canonical = path.canonicalize().map_err(|e| WalkError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(Self {
            key: key.to_owned(),
            path: canonical,
        })
    }

    /// Name a directory archive of the whole root is rooted at.
    pub fn archive_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .unwrap_or_else(|| self.key.clone())
    }
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub entries: Vec<crate::store::ObservedEntry>,
    pub skipped: usize,
}

/// Whether a non-root entry belongs in the index. Excluded directories are not descended into.
pub fn is_indexable(name: &std::ffi::OsStr, file_type: std::fs::FileType) -> bool {
    if name.as_encoded_bytes().first() == Some(&b'.') {
        return false;
    }
    !file_type.is_symlink() && (file_type.is_file() || file_type.is_dir())
}

/// Forward-slash path of `path` relative to `root`, or the root sentinel for the root itself.
pub fn relative_name(root: &std::path::Path, path: &std::path::Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut name = String::new();
    for component in relative.components() {
        let std::path::Component::Normal(part) = component else {
            return None;
        };
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(part.to_str()?);
    }
    if name.is_empty() {
        Some(crate::store::ROOT_NAME.to_owned())
    } else {
        Some(name)
    }
}

/// Walks `root` and returns every indexable entry. Only an unreadable root is an error;
/// unreadable entries below it are logged and skipped.
pub fn walk(root: &MovieRoot) -> Result<WalkOutcome, WalkError> {
    std::fs::read_dir(&root.path).map_err(|e| WalkError::Unreadable {
        path: root.path.clone(),
        source: e,
    })?;

    let mut outcome = WalkOutcome::default();
    let walker = walkdir::WalkDir::new(&root.path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || is_indexable(e.file_name(), e.file_type()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                crate::log_with_context!(warn, e, "Skipping unreadable entry under {:?}", &root.path);
                outcome.skipped += 1;
                continue;
            }
        };

        let Some(name) = relative_name(&root.path, entry.path()) else {
            crate::log_debug!("Skipping entry with non UTF-8 name: {:?}", entry.path());
            outcome.skipped += 1;
            continue;
        };

        crate::log_trace!("Indexed {}:{}", &root.key, &name);
        outcome.entries.push(crate::store::ObservedEntry {
            name,
            is_dir: entry.file_type().is_dir(),
        });
    }

    Ok(outcome)
}

/// Walks `root` and makes the store agree with what was found.
pub fn index_root(
    root: &MovieRoot,
    store: &crate::store::IndexStore,
) -> Result<crate::store::ReconcileReport, crate::AppError> {
    let outcome = walk(root)?;
    let report = store.reconcile(&root.key, &outcome.entries)?;
    crate::log_debug!(
        "Indexed root '{}': {} present, {} added, {} removed, {} skipped",
        &root.key,
        report.present,
        report.added,
        report.removed,
        outcome.skipped
    );
    Ok(report)
}
