//! Per-path operation policy.
//!
//! [`Policy::allowed`] computes the set of [`FileOperation`]s a caller may
//! perform on a logical path. Rules are written as slash-separated globs:
//! `*` matches exactly one segment, a trailing `**` matches one or more.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use hearth_types::{ErrorCode, FileKind, FileOperation, LogicalPath};

use crate::error::{FsError, FsResult};

/// Glob match over `/`-separated segments.
pub fn matches_glob(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    for (i, token) in pattern.iter().enumerate() {
        match *token {
            "**" => return i == pattern.len() - 1 && path.len() > i,
            "*" if i < path.len() => {}
            literal if path.get(i) == Some(&literal) => {}
            _ => return false,
        }
    }
    pattern.len() == path.len()
}

fn matches_any(patterns: &[&str], path: &str) -> bool {
    patterns.iter().any(|p| matches_glob(p, path))
}

/// No new items may be created inside these.
const READ_ONLY: &[&str] = &["/External", "/Network", "/Network/*", "/Backups", "/Backups/**"];

/// Only the exact paths are protected, not their children.
const PROTECTED: &[&str] = &[
    "/*",
    "/Home/Downloads",
    "/External/*",
    "/Network/*",
    "/Network/*/*",
    "/Backups",
    "/Backups/**",
];

const UNSHAREABLE: &[&str] = &[
    "/Apps",
    "/Apps/*",
    "/External",
    "/External/**",
    "/Network",
    "/Network/**",
    "/Backups",
    "/Backups/**",
];

/// Files on removable or remote storage: hard delete only.
const OFF_DEVICE: &[&str] = &["/External/*/**", "/Network/*/*/**"];

const TRASH: &[&str] = &["/Trash/**"];

const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".zip", ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".7z", ".rar",
    ".gz", ".bz2", ".xz",
];

/// True for names the archive collaborator can extract.
pub fn is_archive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Knows which app ids are installed. App lifecycle is owned elsewhere.
pub trait AppRegistry: Send + Sync {
    fn is_installed(&self, app_id: &str) -> bool;
}

/// A fixed set of installed apps.
#[derive(Debug, Default, Clone)]
pub struct StaticApps(HashSet<String>);

impl StaticApps {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }
}

impl AppRegistry for StaticApps {
    fn is_installed(&self, app_id: &str) -> bool {
        self.0.contains(app_id)
    }
}

#[derive(Clone)]
pub struct Policy {
    apps: Arc<dyn AppRegistry>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy").finish_non_exhaustive()
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(Arc::new(StaticApps::default()))
    }
}

impl Policy {
    pub fn new(apps: Arc<dyn AppRegistry>) -> Self {
        Self { apps }
    }

    /// Operations allowed on `path`. `kind` is `None` when the path does not
    /// exist (or could not be inspected).
    pub fn allowed(&self, path: &LogicalPath, kind: Option<FileKind>) -> BTreeSet<FileOperation> {
        use FileOperation::*;

        let p = path.as_str();
        if path.is_root() {
            return BTreeSet::new();
        }

        let mut ops: BTreeSet<FileOperation> =
            [Copy, Move, Rename, Trash, Archive, Writable].into_iter().collect();

        match kind {
            Some(FileKind::File) if path.file_name().is_some_and(is_archive) => {
                ops.insert(Extract);
            }
            Some(FileKind::Directory) => {
                ops.insert(Favorite);
                ops.insert(Share);
            }
            _ => {}
        }

        if matches_any(READ_ONLY, p) {
            ops.remove(&Writable);
        }
        // Archives are written next to the item.
        if matches_any(READ_ONLY, path.parent().as_str()) {
            ops.remove(&Archive);
        }

        let protected = if matches_glob("/Apps/*", p) {
            path.file_name().is_some_and(|id| self.apps.is_installed(id))
        } else {
            matches_any(PROTECTED, p)
        };
        if protected {
            for op in [Move, Rename, Trash, Delete] {
                ops.remove(&op);
            }
        }

        if matches_any(UNSHAREABLE, p) {
            ops.remove(&Share);
        }

        if matches_any(OFF_DEVICE, p) {
            ops.remove(&Trash);
            ops.insert(Delete);
        }

        if matches_any(TRASH, p) {
            for op in [Extract, Archive, Share, Favorite, Trash] {
                ops.remove(&op);
            }
            ops.insert(Restore);
            ops.insert(Delete);
        }

        ops
    }

    /// Fail with `operation-not-allowed` unless `op` is permitted.
    pub fn require(
        &self,
        path: &LogicalPath,
        kind: Option<FileKind>,
        op: FileOperation,
    ) -> FsResult<()> {
        if self.allowed(path, kind).contains(&op) {
            Ok(())
        } else {
            Err(FsError::coded(
                ErrorCode::OperationNotAllowed,
                format!("{op} on {path}"),
            ))
        }
    }
}
