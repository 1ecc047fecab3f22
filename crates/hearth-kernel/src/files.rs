//! The file API callers talk to.
//!
//! [`Files`] reads through a session's [`PathMapper`], so a Rewind alias makes
//! `/Home` list snapshot content. Policy is always evaluated on the canonical
//! location, which keeps snapshot items read-only even though they appear
//! under a live-looking path. Transfer sources are canonicalized; transfer
//! destinations are live paths, so copying out of a snapshot restores it.

use std::collections::{BTreeSet, VecDeque};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use hearth_types::{
    Collision, DirectoryListing, ErrorCode, FileKind, FileOperation, FileSystemItem, JobId,
    LogicalPath, TransferJob,
};

use crate::config::HearthConfig;
use crate::error::{FsError, FsResult, IoOp};
use crate::locks::PathLockGuard;
use crate::mapper::PathMapper;
use crate::policy::Policy;
use crate::resolver::PathResolver;
use crate::transfer::{TransferEngine, TransferRequest};
use crate::trash::{TrashStore, trash_root};

/// Results returned by [`Files::search`] when the caller sets no limit.
pub const DEFAULT_SEARCH_LIMIT: usize = 250;

/// Listing knobs taken from [`HearthConfig`].
#[derive(Debug, Clone)]
pub struct ListingSettings {
    pub max_directory_listing: usize,
    pub hidden_names: Vec<String>,
    pub hidden_extensions: Vec<String>,
}

impl ListingSettings {
    pub fn from_config(config: &HearthConfig) -> Self {
        Self {
            max_directory_listing: config.max_directory_listing.max(1),
            hidden_names: config.hidden_names.clone(),
            hidden_extensions: config.hidden_extensions.clone(),
        }
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.hidden_names.iter().any(|n| n == name)
            || self.hidden_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self::from_config(&HearthConfig::default())
    }
}

fn kind_of(meta: &Metadata) -> FileKind {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    }
}

fn modified_millis(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// MIME type from the file extension; unknown extensions are
/// `application/octet-stream`.
pub fn mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// Read and write operations over logical paths for one browsing session.
#[derive(Clone)]
pub struct Files {
    mapper: Arc<PathMapper>,
    resolver: PathResolver,
    policy: Policy,
    engine: TransferEngine,
    trash: TrashStore,
    settings: ListingSettings,
}

impl std::fmt::Debug for Files {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Files")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Files {
    pub fn new(
        mapper: Arc<PathMapper>,
        resolver: PathResolver,
        policy: Policy,
        engine: TransferEngine,
        trash: TrashStore,
        settings: ListingSettings,
    ) -> Self {
        Self {
            mapper,
            resolver,
            policy,
            engine,
            trash,
            settings,
        }
    }

    /// The same API over another session's mapper.
    pub fn with_mapper(&self, mapper: Arc<PathMapper>) -> Self {
        Self {
            mapper,
            ..self.clone()
        }
    }

    pub fn mapper(&self) -> &Arc<PathMapper> {
        &self.mapper
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn settings(&self) -> &ListingSettings {
        &self.settings
    }

    fn resolve(&self, path: &LogicalPath) -> FsResult<std::path::PathBuf> {
        self.mapper.resolve(&self.resolver, path)
    }

    fn allowed(&self, canonical: &LogicalPath, kind: Option<FileKind>) -> BTreeSet<FileOperation> {
        self.policy.allowed(canonical, kind)
    }

    fn build_item(
        &self,
        path: LogicalPath,
        canonical: &LogicalPath,
        meta: &Metadata,
    ) -> FileSystemItem {
        let kind = kind_of(meta);
        let name = path.file_name().unwrap_or_default().to_string();
        FileSystemItem {
            mime_type: (kind == FileKind::File).then(|| mime_type(&name).to_string()),
            size: if kind == FileKind::Directory { 0 } else { meta.len() },
            modified_at: modified_millis(meta),
            allowed_operations: self.allowed(canonical, Some(kind)),
            name,
            path,
            kind,
        }
    }

    /// Operations permitted on `path`.
    pub async fn allowed_operations(&self, path: &LogicalPath) -> FsResult<BTreeSet<FileOperation>> {
        let canonical = self.mapper.canonical(path)?;
        let kind = match self.resolve(path) {
            Ok(physical) => tokio::fs::symlink_metadata(&physical).await.ok().map(|m| kind_of(&m)),
            Err(_) => None,
        };
        Ok(self.allowed(&canonical, kind))
    }

    /// One item, without following symlinks.
    pub async fn status(&self, path: &LogicalPath) -> FsResult<FileSystemItem> {
        let physical = self.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Stat, path.to_string()))?;
        let canonical = self.mapper.canonical(path)?;
        Ok(self.build_item(path.clone(), &canonical, &meta))
    }

    /// Directory contents, hidden files skipped, capped at
    /// `max_directory_listing` entries.
    #[tracing::instrument(skip_all, fields(path = %path))]
    pub async fn list(&self, path: &LogicalPath) -> FsResult<DirectoryListing> {
        if path.is_root() {
            return Ok(self.list_root().await);
        }

        let directory = self.status(path).await?;
        if directory.kind != FileKind::Directory {
            return Err(FsError::coded(ErrorCode::InvalidPath, format!("{path} is not a directory")));
        }
        let physical = self.resolve(path)?;
        let canonical = self.mapper.canonical(path)?;

        let mut dir = tokio::fs::read_dir(&physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Stat, path.to_string()))?;
        let mut files = Vec::new();
        let mut truncated_at = None;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(FsError::from_io(e, IoOp::Stat, path.to_string())),
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(entry = ?entry.path(), "skipping non UTF-8 name");
                continue;
            };
            if self.settings.is_hidden(&name) {
                continue;
            }
            match self.child_item(path, &canonical, &name, &entry.path()).await {
                Ok(item) => files.push(item),
                Err(e) => tracing::error!(file = name, error = %e, "failed to get status"),
            }
            if files.len() >= self.settings.max_directory_listing {
                truncated_at = Some(self.settings.max_directory_listing);
                break;
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DirectoryListing {
            directory,
            files,
            truncated_at,
        })
    }

    async fn child_item(
        &self,
        parent: &LogicalPath,
        canonical_parent: &LogicalPath,
        name: &str,
        physical: &Path,
    ) -> FsResult<FileSystemItem> {
        let meta = tokio::fs::symlink_metadata(physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Stat, name.to_string()))?;
        let path = parent.join(name)?;
        let canonical = canonical_parent.join(name)?;
        Ok(self.build_item(path, &canonical, &meta))
    }

    /// `/` has no physical directory: it lists the top-level base directories.
    async fn list_root(&self) -> DirectoryListing {
        let table = self.mapper.snapshot();
        let mut files = Vec::new();
        for (logical, _) in table.entries().filter(|(l, _)| l.depth() == 1) {
            match self.status(logical).await {
                Ok(item) => files.push(item),
                Err(e) => tracing::debug!(path = %logical, error = %e, "base directory unavailable"),
            }
        }
        DirectoryListing {
            directory: FileSystemItem {
                path: LogicalPath::root(),
                name: String::new(),
                kind: FileKind::Directory,
                mime_type: None,
                size: 0,
                modified_at: 0,
                allowed_operations: BTreeSet::new(),
            },
            files,
            truncated_at: None,
        }
    }

    /// Case-insensitive name search under `root`, breadth first. Symlinks are
    /// reported but never followed.
    #[tracing::instrument(skip_all, fields(root = %root, query))]
    pub async fn search(
        &self,
        root: &LogicalPath,
        query: &str,
        limit: Option<usize>,
    ) -> FsResult<Vec<FileSystemItem>> {
        let needle = query.trim().to_lowercase();
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut queue: VecDeque<LogicalPath> = if root.is_root() {
            let table = self.mapper.snapshot();
            table.entries().filter(|(l, _)| l.depth() == 1).map(|(l, _)| l.clone()).collect()
        } else {
            VecDeque::from([root.clone()])
        };
        let mut found = Vec::new();

        while let Some(dir) = queue.pop_front() {
            let Ok(physical) = self.resolve(&dir) else {
                continue;
            };
            let canonical = self.mapper.canonical(&dir)?;
            let mut entries = match tokio::fs::read_dir(&physical).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(dir = %dir, error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if self.settings.is_hidden(&name) {
                    continue;
                }
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    if let Ok(child) = dir.join(&name) {
                        queue.push_back(child);
                    }
                }
                if !name.to_lowercase().contains(&needle) {
                    continue;
                }
                match self.child_item(&dir, &canonical, &name, &entry.path()).await {
                    Ok(item) => found.push(item),
                    Err(e) => tracing::debug!(file = name, error = %e, "search hit vanished"),
                }
                if found.len() >= limit {
                    return Ok(found);
                }
            }
        }
        Ok(found)
    }

    /// Create `path`. An existing directory is success.
    pub async fn create_directory(&self, path: &LogicalPath) -> FsResult<LogicalPath> {
        let parent = path.parent();
        self.policy.require(
            &self.mapper.canonical(&parent)?,
            Some(FileKind::Directory),
            FileOperation::Writable,
        )?;
        let physical = self.resolve(path)?;
        match tokio::fs::create_dir(&physical).await {
            Ok(()) => {
                tracing::debug!(path = %path, "created directory");
                Ok(path.clone())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match tokio::fs::metadata(&physical).await {
                    Ok(meta) if meta.is_dir() => Ok(path.clone()),
                    _ => Err(FsError::coded(ErrorCode::DestinationAlreadyExists, path.to_string())),
                }
            }
            Err(e) => Err(FsError::from_io(e, IoOp::Mkdir, path.to_string())),
        }
    }

    /// Rename in place. Returns the new path; renaming to the current name
    /// is a no-op.
    pub async fn rename(&self, path: &LogicalPath, new_name: &str) -> FsResult<LogicalPath> {
        let physical = self.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Move, path.to_string()))?;
        self.policy.require(
            &self.mapper.canonical(path)?,
            Some(kind_of(&meta)),
            FileOperation::Rename,
        )?;

        let target = path.parent().join(new_name)?;
        if path.file_name() == Some(new_name) {
            return Ok(path.clone());
        }
        let target_physical = self.resolve(&target)?;
        let _guard = self.hold(path, vec![physical.clone(), target_physical.clone()])?;
        if tokio::fs::symlink_metadata(&target_physical).await.is_ok() {
            return Err(FsError::coded(ErrorCode::DestinationAlreadyExists, target.to_string()));
        }
        tokio::fs::rename(&physical, &target_physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Move, path.to_string()))?;
        tracing::info!(from = %path, to = %target, "renamed");
        Ok(target)
    }

    /// Permanently delete. Returns false when removal failed part way.
    pub async fn delete(&self, path: &LogicalPath) -> FsResult<bool> {
        let physical = self.resolve(path)?;
        let meta = tokio::fs::symlink_metadata(&physical)
            .await
            .map_err(|e| FsError::from_io(e, IoOp::Stat, path.to_string()))?;
        let canonical = self.mapper.canonical(path)?;
        self.policy.require(&canonical, Some(kind_of(&meta)), FileOperation::Delete)?;
        if self.engine.locks().is_locked(&physical) {
            return Err(FsError::coded(ErrorCode::InProgress, path.to_string()));
        }

        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&physical).await
        } else {
            tokio::fs::remove_file(&physical).await
        };
        if let Err(e) = removed {
            tracing::error!(path = %path, error = %e, "failed to delete");
            return Ok(false);
        }

        // Deleting a top-level trash entry drops its record too.
        if canonical.parent() == trash_root() {
            if let Some(entry) = canonical.file_name() {
                self.trash.remove(entry).await?;
            }
        }
        tracing::info!(path = %path, "deleted");
        Ok(true)
    }

    /// Remove everything in the trash and every trash record. Fails with
    /// `in-progress` while a transfer touches anything in the trash.
    pub async fn empty_trash(&self) -> FsResult<bool> {
        let trash = self.mapper.defaults().resolve(&self.resolver, &trash_root())?;
        let _guard = self.hold(&trash_root(), vec![trash.clone()])?;
        let mut ok = true;
        match tokio::fs::read_dir(&trash).await {
            Ok(mut dir) => loop {
                let entry = match dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read trash");
                        ok = false;
                        break;
                    }
                };
                let path = entry.path();
                let removed = match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
                    _ => tokio::fs::remove_file(&path).await,
                };
                if let Err(e) = removed {
                    tracing::error!(entry = ?entry.file_name(), error = %e, "failed to remove from trash");
                    ok = false;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::from_io(e, IoOp::Stat, "reading trash")),
        }
        Ok(self.trash.clear().await && ok)
    }

    /// Hold `physical` against transfer jobs until the guard drops.
    fn hold(&self, path: &LogicalPath, physical: Vec<PathBuf>) -> FsResult<PathLockGuard> {
        self.engine.locks().try_acquire(JobId::new(), physical).map_err(|conflict| {
            tracing::debug!(%path, holder = %conflict.holder, "path held by a transfer");
            FsError::coded(ErrorCode::InProgress, path.to_string())
        })
    }

    /// Start a transfer. Sources are read through this session's aliases.
    pub async fn transfer(&self, mut request: TransferRequest) -> FsResult<TransferJob> {
        request.sources = request
            .sources
            .iter()
            .map(|s| self.mapper.canonical(s))
            .collect::<FsResult<_>>()?;
        self.engine.start(request).await
    }

    pub async fn copy(
        &self,
        sources: Vec<LogicalPath>,
        destination: LogicalPath,
        collision: Option<Collision>,
    ) -> FsResult<TransferJob> {
        let mut request = TransferRequest::copy(sources, destination);
        request.collision = collision;
        self.transfer(request).await
    }

    pub async fn move_to(
        &self,
        sources: Vec<LogicalPath>,
        destination: LogicalPath,
        collision: Option<Collision>,
    ) -> FsResult<TransferJob> {
        let mut request = TransferRequest::move_to(sources, destination);
        request.collision = collision;
        self.transfer(request).await
    }

    pub async fn trash(&self, sources: Vec<LogicalPath>) -> FsResult<TransferJob> {
        self.transfer(TransferRequest::trash(sources)).await
    }

    pub async fn restore(
        &self,
        sources: Vec<LogicalPath>,
        collision: Option<Collision>,
    ) -> FsResult<TransferJob> {
        let mut request = TransferRequest::restore(sources);
        request.collision = collision;
        self.transfer(request).await
    }
}
