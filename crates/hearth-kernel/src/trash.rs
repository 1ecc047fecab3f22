//! Trash metadata.
//!
//! Trashing moves an item to `/Trash/<name>` and records its original logical
//! path in `<meta_dir>/<name>.json`. Restoring reads that record back. Items
//! nested inside a trashed directory (`/Trash/<name>/a/b`) restore relative to
//! the top-level record.

use std::path::{Path, PathBuf};

use hearth_types::{ErrorCode, LogicalPath};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult, IoOp};

/// Logical root of the trash.
pub const TRASH_ROOT: &str = "/Trash";

pub fn trash_root() -> LogicalPath {
    LogicalPath::parse(TRASH_ROOT).unwrap_or_else(|_| LogicalPath::root())
}

/// What is stored per trashed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashMeta {
    /// Where the item lived before it was trashed.
    pub path: LogicalPath,
}

/// Where a trash path should go back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub target: LogicalPath,
    /// Name of the top-level trash entry owning the record.
    pub entry: String,
    /// True when restoring something inside a trashed directory; the record
    /// stays because the rest of the directory is still in the trash.
    pub is_child: bool,
}

/// Reads and writes trash records.
#[derive(Debug, Clone)]
pub struct TrashStore {
    meta_dir: PathBuf,
}

impl TrashStore {
    pub fn new(meta_dir: impl Into<PathBuf>) -> Self {
        Self {
            meta_dir: meta_dir.into(),
        }
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    fn meta_path(&self, entry: &str) -> FsResult<PathBuf> {
        if entry.is_empty() || entry.contains('/') || entry == "." || entry == ".." {
            return Err(FsError::coded(ErrorCode::InvalidFilename, entry.to_string()));
        }
        Ok(self.meta_dir.join(format!("{entry}.json")))
    }

    pub async fn write(&self, entry: &str, original: &LogicalPath) -> FsResult<()> {
        let path = self.meta_path(entry)?;
        tokio::fs::create_dir_all(&self.meta_dir)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Mkdir, "creating trash meta directory"))?;
        let body = serde_json::to_vec(&TrashMeta {
            path: original.clone(),
        })
        .map_err(|e| FsError::coded(ErrorCode::MoveFailed, e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Copy, format!("writing {}", path.display())))
    }

    /// Read a record. Missing or unparsable records are both
    /// `trash-meta-not-exists`.
    pub async fn read(&self, entry: &str) -> FsResult<TrashMeta> {
        let path = self.meta_path(entry)?;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::TrashMeta, format!("reading {}", path.display())))?;
        serde_json::from_slice(&raw).map_err(|e| {
            tracing::warn!(entry, error = %e, "corrupt trash meta");
            FsError::coded(ErrorCode::TrashMetaNotExists, format!("corrupt record for {entry}"))
        })
    }

    pub async fn remove(&self, entry: &str) -> FsResult<()> {
        let path = self.meta_path(entry)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::from_io(e, IoOp::Stat, format!("removing {}", path.display()))),
        }
    }

    /// Work out where `trash_path` (`/Trash/<entry>[/child…]`) restores to.
    pub async fn restore_target(&self, trash_path: &LogicalPath) -> FsResult<RestoreTarget> {
        let mut segments = trash_path.segments();
        if segments.next() != Some(&TRASH_ROOT[1..]) {
            return Err(FsError::coded(
                ErrorCode::OperationNotAllowed,
                format!("{trash_path} is not in the trash"),
            ));
        }
        let entry = segments
            .next()
            .ok_or_else(|| FsError::coded(ErrorCode::OperationNotAllowed, "cannot restore the trash itself"))?
            .to_string();
        let rest: Vec<&str> = segments.collect();

        let meta = self.read(&entry).await?;
        let is_child = !rest.is_empty();
        let target = if is_child {
            meta.path.join_relative(&rest.join("/"))
        } else {
            meta.path
        };
        Ok(RestoreTarget {
            target,
            entry,
            is_child,
        })
    }

    /// Delete every record. Returns false if any removal failed.
    pub async fn clear(&self) -> bool {
        let mut ok = true;
        let mut dir = match tokio::fs::read_dir(&self.meta_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                tracing::error!(error = %e, "failed to read trash meta directory");
                return false;
            }
        };
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                        tracing::error!(path = %entry.path().display(), error = %e, "failed to remove trash meta");
                        ok = false;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to list trash meta");
                    ok = false;
                    break;
                }
            }
        }
        ok
    }
}
