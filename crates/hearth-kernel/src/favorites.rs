//! Favorite directories, persisted as a JSON list of logical paths.
//!
//! A favorite whose directory is deleted is dropped when the change notifier
//! reports the deletion. Moves and renames look the same as deletions to the
//! watcher, so a moved favorite is dropped too.

use std::path::PathBuf;
use std::sync::Arc;

use hearth_types::{ErrorCode, FileKind, FileOperation, LogicalPath};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, FsResult, IoOp};
use crate::files::Files;
use crate::flows::{ChangeFlow, ChangeKind, SharedChangeFlowBus};

pub struct Favorites {
    file: PathBuf,
    defaults: Vec<LogicalPath>,
    files: Files,
    write: Mutex<()>,
}

impl std::fmt::Debug for Favorites {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Favorites")
            .field("file", &self.file)
            .finish_non_exhaustive()
    }
}

impl Favorites {
    /// `defaults` is what a fresh install starts with, before the file exists.
    pub fn new(file: impl Into<PathBuf>, defaults: Vec<LogicalPath>, files: Files) -> Self {
        Self {
            file: file.into(),
            defaults,
            files,
            write: Mutex::new(()),
        }
    }

    async fn load(&self) -> FsResult<Vec<LogicalPath>> {
        match tokio::fs::read(&self.file).await {
            Ok(raw) => serde_json::from_slice(&raw).or_else(|e| {
                tracing::warn!(file = %self.file.display(), error = %e, "corrupt favorites, starting empty");
                Ok(Vec::new())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(self.defaults.clone()),
            Err(e) => Err(FsError::from_io(e, IoOp::Stat, "reading favorites")),
        }
    }

    async fn save(&self, favorites: &[LogicalPath]) -> FsResult<()> {
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::from_io(e, IoOp::Mkdir, "favorites directory"))?;
        }
        let body = serde_json::to_vec_pretty(favorites)
            .map_err(|e| FsError::coded(ErrorCode::MkdirFailed, e.to_string()))?;
        tokio::fs::write(&self.file, body)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Copy, "writing favorites"))
    }

    /// Favorites that currently exist as directories.
    pub async fn list(&self) -> FsResult<Vec<LogicalPath>> {
        let mut existing = Vec::new();
        for favorite in self.load().await? {
            match self.files.status(&favorite).await {
                Ok(item) if item.kind == FileKind::Directory => existing.push(favorite),
                _ => {}
            }
        }
        Ok(existing)
    }

    /// Add `path`. Returns false if it was already a favorite.
    pub async fn add(&self, path: &LogicalPath) -> FsResult<bool> {
        let allowed = self.files.allowed_operations(path).await?;
        if !allowed.contains(&FileOperation::Favorite) {
            return Err(FsError::coded(ErrorCode::OperationNotAllowed, format!("favorite {path}")));
        }

        let _write = self.write.lock().await;
        let mut favorites = self.load().await?;
        if favorites.contains(path) {
            return Ok(false);
        }
        favorites.push(path.clone());
        self.save(&favorites).await?;
        tracing::debug!(path = %path, "added favorite");
        Ok(true)
    }

    /// Remove `path`. Returns false if it was not a favorite.
    pub async fn remove(&self, path: &LogicalPath) -> FsResult<bool> {
        let _write = self.write.lock().await;
        let mut favorites = self.load().await?;
        let before = favorites.len();
        favorites.retain(|f| f != path);
        if favorites.len() == before {
            return Ok(false);
        }
        self.save(&favorites).await?;
        Ok(true)
    }

    /// Drop every favorite at or below a deleted path.
    pub async fn handle_change(&self, change: &ChangeFlow) -> FsResult<usize> {
        if change.kind != ChangeKind::Deleted {
            return Ok(0);
        }
        let _write = self.write.lock().await;
        let mut favorites = self.load().await?;
        let before = favorites.len();
        favorites.retain(|f| !f.starts_with(&change.path));
        let removed = before - favorites.len();
        if removed > 0 {
            self.save(&favorites).await?;
            tracing::info!(path = %change.path, removed, "removed deleted favorites");
        }
        Ok(removed)
    }

    /// Follow `fs.deleted` events until `cancel` fires or the bus closes.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &SharedChangeFlowBus,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut sub = bus.subscribe("fs.deleted");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = self.handle_change(&msg.payload).await {
                                tracing::warn!(error = %e, "favorites update failed");
                            }
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("favorites listener stopped");
        })
    }
}
